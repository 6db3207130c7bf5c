//! # Presence Node
//!
//! [`PresenceNode`] wires every component of one cluster member together and
//! owns its background tasks. The host constructs it once, calls
//! [`start`](PresenceNode::start), forwards its player lifecycle callbacks to
//! [`sessions`](PresenceNode::sessions) and calls
//! [`shutdown`](PresenceNode::shutdown) before exiting.
//!
//! ## Startup
//!
//! 1. Check the store version (streams with `MAXLEN` trimming are required)
//! 2. Run the [`StartupGuard`] against recent heartbeats under this id
//! 3. Clear leftovers of an earlier run of this proxy
//! 4. Spawn heartbeat, stream consumer, channel listener and reconciliation
//!
//! ## Shutdown
//!
//! The tasks are stopped, local players are marked offline with a `leave`
//! each, then `death` is published and the online set is deleted.

use crate::cache::PresenceCache;
use crate::config::PresenceConfig;
use crate::envelope::{Envelope, EnvelopeHandler};
use crate::error::PresenceError;
use crate::events::{NetworkEvent, NetworkEvents};
use crate::keys::{KeySpace, ALL_PROXIES, UUID_CACHE_KEY};
use crate::liveness::{start_heartbeat, ProxyRegistry, StartupGuard};
use crate::platform::ProxyPlatform;
use crate::profile::ProfileLookup;
use crate::pubsub::PlayerEventListener;
use crate::reconcile::{start_reconciliation, ReconcileReport, Reconciler};
use crate::session::SessionStore;
use crate::store::{supports_streams, SharedStore};
use crate::stream::EventLog;
use crate::translator::UuidTranslator;
use crate::types::{HeartbeatData, ProxyNode};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// `uuid-cache` size above which operators are told to purge it.
const UUID_CACHE_PURGE_HINT: usize = 750_000;

/// How long shutdown waits for each background task before aborting it.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives every envelope other proxies send to this one.
struct NodeInner {
    proxy_id: String,
    registry: Arc<ProxyRegistry>,
    sessions: SessionStore,
    platform: Arc<dyn ProxyPlatform>,
    events: NetworkEvents,
}

impl NodeInner {
    async fn on_death(&self, proxy: &str) -> Result<(), PresenceError> {
        let known = self.registry.remove(proxy).is_some();
        let members = self.sessions.announce_departure(proxy).await?;
        if !members.is_empty() {
            self.sessions.clear_proxy(proxy, &members).await?;
        }
        if known || !members.is_empty() {
            info!("Proxy {} left the cluster ({} players announced as leaving)", proxy, members.len());
        }
        Ok(())
    }
}

#[async_trait]
impl EnvelopeHandler for NodeInner {
    async fn handle(&self, envelope: Envelope) -> Result<(), PresenceError> {
        match envelope {
            Envelope::Heartbeat {
                proxy,
                heartbeat,
                players,
            } => {
                self.registry.observe_heartbeat(&proxy, HeartbeatData { heartbeat, players });
            }
            Envelope::Death { proxy } => self.on_death(&proxy).await?,
            Envelope::RunCommand { proxy, target, command } => {
                if target == self.proxy_id || target == ALL_PROXIES {
                    info!("⌨️ Running command from {}: {}", proxy, command);
                    self.platform.execute_command(&command);
                }
            }
            Envelope::RelayMessage { channel, message, .. } => {
                self.events.emit(NetworkEvent::PubSubMessage { channel, message });
            }
            Envelope::Join { proxy, uuid } => self.sessions.on_remote_join(uuid, proxy),
            Envelope::Leave { proxy, uuid } => self.sessions.on_remote_leave(uuid, proxy),
            Envelope::ServerChange { uuid, from, to, .. } => self.sessions.on_remote_server_change(uuid, from, to),
            Envelope::Kick { uuid, message, .. } => self.sessions.on_remote_kick(uuid, &message),
        }
        Ok(())
    }
}

/// One running member of the proxy cluster.
pub struct PresenceNode {
    config: PresenceConfig,
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    inner: Arc<NodeInner>,
    log: Arc<EventLog>,
    translator: Arc<UuidTranslator>,
    running: AtomicBool,
    shutdown_sender: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PresenceNode {
    /// Builds every component of a node without touching the store.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated before anything is built
    /// * `store` - Shared store client used by every component
    /// * `platform` - The host proxy runtime
    /// * `lookup` - External profile service, `None` to resolve from caches only
    pub fn new(
        config: PresenceConfig,
        store: Arc<dyn SharedStore>,
        platform: Arc<dyn ProxyPlatform>,
        lookup: Option<Arc<dyn ProfileLookup>>,
    ) -> Result<Self, PresenceError> {
        config.validate()?;

        let keys = KeySpace::new(&config.network_id);
        let registry = Arc::new(ProxyRegistry::new(&config.proxy_id, config.liveness_window));
        let events = NetworkEvents::default();
        let cache = Arc::new(PresenceCache::new(config.attribute_cache_ttl, config.aggregate_cache_ttl));
        let translator = Arc::new(UuidTranslator::new(
            store.clone(),
            platform.clone(),
            lookup,
            config.online_mode,
            config.uuid_cache_ttl,
        ));
        let sessions = SessionStore::new(
            store.clone(),
            keys.clone(),
            &config.proxy_id,
            platform.clone(),
            cache,
            events.clone(),
            registry.clone(),
            translator.clone(),
        );
        let log = Arc::new(EventLog::new(store.clone(), &config.proxy_id, config.stream_max_len));
        let inner = Arc::new(NodeInner {
            proxy_id: config.proxy_id.clone(),
            registry,
            sessions,
            platform,
            events,
        });
        let (shutdown_sender, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            keys,
            inner,
            log,
            translator,
            running: AtomicBool::new(false),
            shutdown_sender,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Verifies the store and this proxy id, then spawns the background tasks.
    ///
    /// # Returns
    ///
    /// [`PresenceError::UnsupportedStoreVersion`] or
    /// [`PresenceError::ImpostorDetected`] abort startup; the node can be
    /// dropped afterwards without calling [`shutdown`](Self::shutdown).
    pub async fn start(&self) -> Result<(), PresenceError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PresenceError::InvalidState(format!(
                "proxy {} is already running",
                self.config.proxy_id
            )));
        }
        if let Err(e) = self.prepare().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.shutdown_sender.send_replace(false);

        let handler: Arc<dyn EnvelopeHandler> = self.inner.clone();
        let platform = self.inner.platform.clone();
        let reconciler = Reconciler::new(self.inner.sessions.clone(), self.inner.registry.clone(), platform.clone());

        let mut tasks = self.tasks.lock().await;
        tasks.push(
            self.log
                .consumer(self.config.retry_backoff)
                .start(handler.clone(), self.shutdown_sender.subscribe()),
        );
        tasks.push(
            PlayerEventListener::new(self.store.clone(), &self.config.proxy_id, self.config.retry_backoff)
                .start(handler, self.shutdown_sender.subscribe()),
        );
        tasks.push(start_heartbeat(
            self.inner.registry.clone(),
            self.log.clone(),
            platform,
            self.config.heartbeat_interval,
            self.shutdown_sender.subscribe(),
        ));
        tasks.push(start_reconciliation(
            reconciler,
            self.config.reconcile_interval,
            self.shutdown_sender.subscribe(),
        ));

        info!(
            "🚀 Proxy {} joined network '{}' (instance {})",
            self.config.proxy_id,
            self.config.network_id,
            self.log.instance_id()
        );
        Ok(())
    }

    async fn prepare(&self) -> Result<(), PresenceError> {
        let version = self.store.server_version().await?;
        if !supports_streams(&version) {
            error!("🚨 Store version {} is too old, streams with MAXLEN trimming need 6.2 or newer", version);
            return Err(PresenceError::UnsupportedStoreVersion(version));
        }
        info!("🔗 Connected to store version {}", version);

        let cached_names = self.store.hlen(UUID_CACHE_KEY).await?;
        if cached_names > UUID_CACHE_PURGE_HINT {
            info!(
                "uuid-cache holds {} entries, consider purging expired entries to reclaim memory",
                cached_names
            );
        }

        let mut guard = StartupGuard::new(
            &self.config.proxy_id,
            self.config.liveness_window,
            self.config.crash_marker.clone(),
        );
        guard.verify(self.store.as_ref()).await?;

        let leftovers = self.inner.sessions.stored_members(&self.config.proxy_id).await?;
        if !leftovers.is_empty() {
            warn!(
                "Found {} players left over from an earlier run of proxy {}, marking them offline",
                leftovers.len(),
                self.config.proxy_id
            );
        }
        let leftovers: Vec<_> = leftovers.into_iter().collect();
        self.inner.sessions.clear_proxy(&self.config.proxy_id, &leftovers).await?;
        Ok(())
    }

    /// Leaves the cluster cleanly. Calling it on a node that is not running
    /// does nothing.
    pub async fn shutdown(&self) -> Result<(), PresenceError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Proxy {} is leaving the cluster", self.config.proxy_id);

        // Tasks stop first so no heartbeat can follow the death envelope.
        self.shutdown_sender.send_replace(true);
        let mut tasks = self.tasks.lock().await;
        for mut task in tasks.drain(..) {
            if tokio::time::timeout(TASK_STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("Background task did not stop in {:?}, aborting it", TASK_STOP_TIMEOUT);
                task.abort();
            }
        }
        drop(tasks);

        let released = self.inner.sessions.release_all().await;
        let death = self
            .log
            .publish(&Envelope::Death {
                proxy: self.config.proxy_id.clone(),
            })
            .await;
        let cleared = self.inner.sessions.clear_own_set().await;
        self.inner.registry.clear();

        let released = released?;
        death?;
        cleared?;
        debug!("Released {} local players", released);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn proxy_id(&self) -> &str {
        &self.config.proxy_id
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Session writes and queries.
    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    pub fn translator(&self) -> &Arc<UuidTranslator> {
        &self.translator
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.inner.registry
    }

    /// Subscribes to network notifications for the host.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.events.subscribe()
    }

    /// Handles one envelope as if it had arrived from a peer.
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<(), PresenceError> {
        self.inner.handle(envelope).await
    }

    /// Runs one reconciliation pass outside the timer.
    pub async fn reconcile_now(&self) -> Result<ReconcileReport, PresenceError> {
        Reconciler::new(
            self.inner.sessions.clone(),
            self.inner.registry.clone(),
            self.inner.platform.clone(),
        )
        .run_once()
        .await
    }

    /// Deletes expired `uuid-cache` entries.
    pub async fn purge_uuid_cache(&self) -> Result<usize, PresenceError> {
        self.translator.purge_expired().await
    }

    /// Asks `target` to run a console command; [`ALL_PROXIES`] addresses
    /// every proxy, this one included.
    pub async fn send_command_to(&self, target: &str, command: &str) -> Result<(), PresenceError> {
        if target != ALL_PROXIES && !self.inner.registry.is_alive(target) {
            return Err(PresenceError::UnknownProxy(target.to_string()));
        }
        if target == self.config.proxy_id || target == ALL_PROXIES {
            self.inner.platform.execute_command(command);
            if target != ALL_PROXIES {
                return Ok(());
            }
        }
        self.log
            .publish(&Envelope::RunCommand {
                proxy: self.config.proxy_id.clone(),
                target: target.to_string(),
                command: command.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Relays a host message on `channel` to every proxy and raises it
    /// locally as well.
    pub async fn send_channel_message(&self, channel: &str, message: &str) -> Result<(), PresenceError> {
        self.log
            .publish(&Envelope::RelayMessage {
                proxy: self.config.proxy_id.clone(),
                channel: channel.to_string(),
                message: message.to_string(),
            })
            .await?;
        self.inner.events.emit(NetworkEvent::PubSubMessage {
            channel: channel.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    /// Sum of the player counts of every live proxy.
    pub fn total_network_players(&self) -> usize {
        self.inner.registry.total_players()
    }

    pub fn known_proxies(&self) -> Vec<String> {
        self.inner.registry.known_proxies()
    }

    pub fn lagged_proxies(&self) -> Vec<String> {
        self.inner.registry.lagged_proxies()
    }

    pub fn proxy_nodes(&self) -> Vec<ProxyNode> {
        self.inner.registry.nodes()
    }
}
