//! # Reconciliation
//!
//! Periodic repair of drift between what this proxy actually holds and what
//! the store records for it, plus cleanup after peers that vanished without
//! publishing a `death` envelope.
//!
//! One pass runs two steps in order:
//!
//! 1. Diff the locally connected players against this proxy's online set.
//!    Store-only members found under another live proxy are dropped from this
//!    set; the rest are logged off. Local-only players are written back.
//! 2. Every peer whose heartbeat is older than the liveness window has its
//!    members announced as network leaves, its sessions marked offline and
//!    its online set deleted.

use crate::error::PresenceError;
use crate::liveness::ProxyRegistry;
use crate::platform::ProxyPlatform;
use crate::session::SessionStore;
use crate::types::PlayerId;
use crate::utils::shutdown_requested;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Stale members removed from this set because another live proxy owns them
    pub reassigned: usize,
    /// Stale members found nowhere else and logged off
    pub logged_off: usize,
    /// Local players missing from the store and written back
    pub registered: usize,
    /// Lagged proxies whose state was purged
    pub purged_proxies: Vec<String>,
    /// Members of purged proxies announced as leaves
    pub purged_players: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.reassigned == 0
            && self.logged_off == 0
            && self.registered == 0
            && self.purged_proxies.is_empty()
    }
}

pub struct Reconciler {
    sessions: SessionStore,
    registry: Arc<ProxyRegistry>,
    platform: Arc<dyn ProxyPlatform>,
}

impl Reconciler {
    pub fn new(sessions: SessionStore, registry: Arc<ProxyRegistry>, platform: Arc<dyn ProxyPlatform>) -> Self {
        Self {
            sessions,
            registry,
            platform,
        }
    }

    /// Runs both steps once.
    ///
    /// A failure in the local diff does not prevent the lagged-proxy purge.
    pub async fn run_once(&self) -> Result<ReconcileReport, PresenceError> {
        let mut report = ReconcileReport::default();
        let local_result = self.reconcile_local(&mut report).await;
        self.purge_lagged(&mut report).await?;
        local_result?;

        if !report.is_clean() {
            info!(
                "🔧 Reconciliation: {} reassigned, {} logged off, {} re-registered, {} lagged proxies purged ({} players)",
                report.reassigned,
                report.logged_off,
                report.registered,
                report.purged_proxies.len(),
                report.purged_players
            );
        }
        Ok(report)
    }

    async fn reconcile_local(&self, report: &mut ReconcileReport) -> Result<(), PresenceError> {
        // Stored set first: a join landing after this read shows up as
        // local-only, which is repaired without a leave.
        let stored = self.sessions.stored_members(self.sessions.proxy_id()).await?;
        let local: HashMap<PlayerId, _> = self
            .platform
            .local_players()
            .into_iter()
            .map(|player| (player.uuid, player))
            .collect();

        let store_only: Vec<PlayerId> = stored.iter().filter(|uuid| !local.contains_key(uuid)).copied().collect();
        if !store_only.is_empty() {
            let elsewhere = self.members_of_live_peers().await?;
            for uuid in store_only {
                if self.platform.local_player(&uuid).is_some() {
                    debug!("Player {} connected during reconciliation, leaving it alone", uuid);
                } else if elsewhere.contains(&uuid) {
                    warn!("Player {} is recorded here but connected elsewhere, dropping the stale entry", uuid);
                    self.sessions.drop_membership(&uuid).await?;
                    report.reassigned += 1;
                } else {
                    warn!("Player {} is recorded here but not connected, logging it off", uuid);
                    self.sessions.remove_session(uuid).await?;
                    report.logged_off += 1;
                }
            }
        }

        for (uuid, player) in &local {
            if !stored.contains(uuid) {
                warn!("Player {} is connected but missing from the store, re-registering", uuid);
                self.sessions.register_local(player).await?;
                report.registered += 1;
            }
        }
        Ok(())
    }

    async fn members_of_live_peers(&self) -> Result<HashSet<PlayerId>, PresenceError> {
        let mut members = HashSet::new();
        for proxy_id in self.registry.known_proxies() {
            if proxy_id == self.registry.self_id() {
                continue;
            }
            members.extend(self.sessions.stored_members(&proxy_id).await?);
        }
        Ok(members)
    }

    async fn purge_lagged(&self, report: &mut ReconcileReport) -> Result<(), PresenceError> {
        for proxy_id in self.registry.lagged_proxies() {
            let members = self.sessions.announce_departure(&proxy_id).await?;
            self.sessions.clear_proxy(&proxy_id, &members).await?;
            self.registry.remove(&proxy_id);
            warn!(
                "🧹 Proxy {} stopped heartbeating, purged its online set of {} players",
                proxy_id,
                members.len()
            );
            report.purged_players += members.len();
            report.purged_proxies.push(proxy_id);
        }
        Ok(())
    }
}

/// Spawns the reconciliation timer. The first pass runs one full interval
/// after start, giving peers time to announce themselves.
pub fn start_reconciliation(
    reconciler: Reconciler,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = reconciler.run_once().await {
                error!("❌ Reconciliation pass failed: {}", e);
            }
        }
        debug!("Reconciliation task stopped");
    })
}
