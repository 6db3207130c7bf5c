//! # Presence Sync
//!
//! Cluster-wide player presence for a fleet of proxies that share one
//! Redis-compatible store. Every proxy records the players it holds, tells
//! its peers about joins, leaves and server changes, heartbeats its liveness
//! and cleans up after peers that disappeared.
//!
//! ## Core Features
//!
//! - **Session records**: one hash per player plus one online set per proxy
//! - **Player events**: join, leave, server-change and kick fanned out over pub/sub
//! - **Control stream**: heartbeats, deaths, remote commands and relayed
//!   messages on an ordered, capped stream
//! - **Liveness**: in-memory peer table fed by heartbeats, impostor check at startup
//! - **Reconciliation**: periodic repair of drift between local truth and the store
//! - **Name translation**: name ↔ uuid cache with offline derivation and an
//!   external profile lookup fallback
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use presence_sync::{PresenceConfig, PresenceNode, RedisStore, RosterPlatform};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RedisStore::connect("redis://127.0.0.1/").await?);
//! let platform = Arc::new(RosterPlatform::new());
//! let node = PresenceNode::new(PresenceConfig::new("proxy-1", "main"), store, platform, None)?;
//!
//! node.start().await?;
//! let players = node.sessions().network_players().await?;
//! println!("{} players online", players.len());
//! node.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod keys;
pub mod liveness;
pub mod node;
pub mod platform;
pub mod profile;
pub mod pubsub;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod stream;
pub mod translator;
pub mod types;
pub mod utils;

pub use config::PresenceConfig;
pub use envelope::{Envelope, EnvelopeHandler};
pub use error::{LookupError, PresenceError, StoreError};
pub use events::{NetworkEvent, NetworkEvents};
pub use liveness::{GuardState, ProxyRegistry, StartupGuard};
pub use node::PresenceNode;
pub use platform::{ProxyPlatform, RosterPlatform};
pub use profile::{MojangProfileClient, Profile, ProfileLookup};
pub use reconcile::ReconcileReport;
pub use session::{KickOutcome, SessionStore};
pub use store::{MemoryStore, RedisStore, SharedStore, WriteBatch};
pub use translator::{offline_uuid, UuidTranslator};
pub use types::{HeartbeatData, LastSeen, LocalPlayer, PlayerId, PlayerSession, ProxyNode};
