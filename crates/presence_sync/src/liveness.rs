//! # Proxy Liveness
//!
//! Tracks which proxies of the cluster are alive. Peers are learned from the
//! heartbeat envelopes on the event stream and kept in memory only; nothing
//! about liveness is persisted in the store.
//!
//! ## Components
//!
//! - [`ProxyRegistry`] - in-memory table of peers and their last heartbeat
//! - [`StartupGuard`] - refuses to start a second process under a live id
//! - [`start_heartbeat`] - timer publishing this proxy's heartbeat

use crate::envelope::Envelope;
use crate::error::PresenceError;
use crate::keys::{stream_fields, STREAM_KEY};
use crate::platform::ProxyPlatform;
use crate::store::SharedStore;
use crate::stream::EventLog;
use crate::types::{HeartbeatData, ProxyNode};
use crate::utils::{current_timestamp, shutdown_requested};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// In-memory table of cluster members.
///
/// The table never holds this process's own id; the own heartbeat is kept
/// apart and this proxy always counts as alive while it runs.
#[derive(Debug)]
pub struct ProxyRegistry {
    self_id: String,
    liveness_window: Duration,
    peers: DashMap<String, HeartbeatData>,
    own_heartbeat: AtomicU64,
    own_players: AtomicUsize,
}

impl ProxyRegistry {
    pub fn new(self_id: impl Into<String>, liveness_window: Duration) -> Self {
        Self {
            self_id: self_id.into(),
            liveness_window,
            peers: DashMap::new(),
            own_heartbeat: AtomicU64::new(0),
            own_players: AtomicUsize::new(0),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    fn is_fresh(&self, heartbeat: u64, now: u64) -> bool {
        now.saturating_sub(heartbeat) <= self.liveness_window.as_secs()
    }

    /// Records this proxy's own heartbeat.
    pub fn record_own(&self, data: HeartbeatData) {
        self.own_heartbeat.store(data.heartbeat, Ordering::Relaxed);
        self.own_players.store(data.players, Ordering::Relaxed);
    }

    /// Records a peer heartbeat.
    ///
    /// # Returns
    ///
    /// `true` if the peer was not in the table before.
    pub fn observe_heartbeat(&self, proxy_id: &str, data: HeartbeatData) -> bool {
        if proxy_id == self.self_id {
            return false;
        }
        let first_seen = self.peers.insert(proxy_id.to_string(), data).is_none();
        if first_seen {
            info!("🤝 Proxy {} joined the cluster", proxy_id);
        }
        first_seen
    }

    /// Drops a peer, returning its last heartbeat if it was known.
    pub fn remove(&self, proxy_id: &str) -> Option<HeartbeatData> {
        self.peers.remove(proxy_id).map(|(_, data)| data)
    }

    /// Point query against the in-memory table; this proxy counts as alive.
    pub fn is_alive(&self, proxy_id: &str) -> bool {
        if proxy_id == self.self_id {
            return true;
        }
        let now = current_timestamp();
        self.peers
            .get(proxy_id)
            .is_some_and(|data| self.is_fresh(data.heartbeat, now))
    }

    /// Ids of every live proxy, this one included, sorted.
    pub fn known_proxies(&self) -> Vec<String> {
        let now = current_timestamp();
        let mut ids: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| self.is_fresh(entry.value().heartbeat, now))
            .map(|entry| entry.key().clone())
            .collect();
        ids.push(self.self_id.clone());
        ids.sort();
        ids
    }

    /// Ids of peers whose heartbeat is older than the liveness window.
    pub fn lagged_proxies(&self) -> Vec<String> {
        let now = current_timestamp();
        let mut ids: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| !self.is_fresh(entry.value().heartbeat, now))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Sum of the player counts reported by every live proxy.
    pub fn total_players(&self) -> usize {
        let now = current_timestamp();
        let peers: usize = self
            .peers
            .iter()
            .filter(|entry| self.is_fresh(entry.value().heartbeat, now))
            .map(|entry| entry.value().players)
            .sum();
        peers + self.own_players.load(Ordering::Relaxed)
    }

    pub fn peer(&self, proxy_id: &str) -> Option<ProxyNode> {
        self.peers.get(proxy_id).map(|entry| ProxyNode {
            proxy_id: entry.key().clone(),
            last_heartbeat_epoch_seconds: entry.value().heartbeat,
            online_player_count: entry.value().players,
        })
    }

    /// Snapshot of every peer in the table, live or lagged.
    pub fn nodes(&self) -> Vec<ProxyNode> {
        let mut nodes: Vec<ProxyNode> = self
            .peers
            .iter()
            .map(|entry| ProxyNode {
                proxy_id: entry.key().clone(),
                last_heartbeat_epoch_seconds: entry.value().heartbeat,
                online_player_count: entry.value().players,
            })
            .collect();
        nodes.sort_by(|a, b| a.proxy_id.cmp(&b.proxy_id));
        nodes
    }

    /// This proxy's last published heartbeat, `0` before the first one.
    pub fn own_heartbeat(&self) -> u64 {
        self.own_heartbeat.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.peers.clear();
    }
}

/// States of the startup guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    New,
    Verifying,
    Active,
    /// Terminal: another live process holds this proxy id
    Aborted,
}

/// Refuses to start a process under an id that is still heartbeating.
#[derive(Debug)]
pub struct StartupGuard {
    proxy_id: String,
    liveness_window: Duration,
    crash_marker: Option<PathBuf>,
    state: GuardState,
}

impl StartupGuard {
    pub fn new(proxy_id: impl Into<String>, liveness_window: Duration, crash_marker: Option<PathBuf>) -> Self {
        Self {
            proxy_id: proxy_id.into(),
            liveness_window,
            crash_marker,
            state: GuardState::New,
        }
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    /// Checks the stream for a recent heartbeat published under this id.
    ///
    /// A heartbeat followed by a `death` from the same id is a clean shutdown
    /// and does not count. A present crash marker lets the check pass when the
    /// recent heartbeat belongs to this proxy's own crashed predecessor; the
    /// marker is removed once the guard is active.
    ///
    /// # Returns
    ///
    /// `Ok(())` once the guard is [`GuardState::Active`], or
    /// [`PresenceError::ImpostorDetected`] when it aborted.
    pub async fn verify(&mut self, store: &dyn SharedStore) -> Result<(), PresenceError> {
        match self.state {
            GuardState::Active => return Ok(()),
            GuardState::Aborted => return Err(PresenceError::ImpostorDetected(self.proxy_id.clone())),
            GuardState::New | GuardState::Verifying => {}
        }
        self.state = GuardState::Verifying;

        let marker_present = self.crash_marker_present().await;
        let recent = match last_heartbeat(store, &self.proxy_id, self.liveness_window).await {
            Ok(recent) => recent,
            Err(e) => {
                self.state = GuardState::New;
                return Err(e);
            }
        };

        match recent {
            Some(age) if !marker_present => {
                error!(
                    "🚨 Proxy id '{}' heartbeated {}s ago from another process. Possible impostor instance! \
                     If this proxy crashed, create the crash marker file and start again.",
                    self.proxy_id, age
                );
                self.state = GuardState::Aborted;
                Err(PresenceError::ImpostorDetected(self.proxy_id.clone()))
            }
            Some(age) => {
                warn!(
                    "Proxy id '{}' heartbeated {}s ago, starting anyway because a crash marker was present",
                    self.proxy_id, age
                );
                self.activate(marker_present).await;
                Ok(())
            }
            None => {
                self.activate(marker_present).await;
                Ok(())
            }
        }
    }

    async fn activate(&mut self, marker_present: bool) {
        self.state = GuardState::Active;
        if !marker_present {
            return;
        }
        let Some(path) = &self.crash_marker else {
            return;
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!("Removed crash marker {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Crash marker {} could not be removed: {}", path.display(), e),
        }
    }

    async fn crash_marker_present(&self) -> bool {
        match &self.crash_marker {
            Some(path) => tokio::fs::try_exists(path).await.unwrap_or(true),
            None => false,
        }
    }
}

/// Age in seconds of the newest heartbeat `proxy_id` appended within the
/// liveness window, by store clock. `None` when there is none, or when a
/// `death` from the same id came after it.
async fn last_heartbeat(
    store: &dyn SharedStore,
    proxy_id: &str,
    window: Duration,
) -> Result<Option<u64>, PresenceError> {
    let now_millis = store.time_millis().await?;
    let since = now_millis.saturating_sub(window.as_millis() as u64);
    for entry in store.read_recent(STREAM_KEY, since).await? {
        let Some(payload) = entry.field(stream_fields::PAYLOAD) else {
            continue;
        };
        match Envelope::decode(payload) {
            Ok(Envelope::Heartbeat { proxy, heartbeat, .. }) if proxy == proxy_id => {
                return Ok(Some((now_millis / 1000).saturating_sub(heartbeat)));
            }
            Ok(Envelope::Death { proxy }) if proxy == proxy_id => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

/// Spawns the heartbeat timer.
///
/// Every tick records this proxy's load in the registry and appends a
/// heartbeat envelope to the stream. A failed append is logged and retried on
/// the next tick. The task ends when `shutdown` turns `true`.
pub fn start_heartbeat(
    registry: Arc<ProxyRegistry>,
    log: Arc<EventLog>,
    platform: Arc<dyn ProxyPlatform>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            let data = HeartbeatData {
                heartbeat: current_timestamp(),
                players: platform.local_player_count(),
            };
            registry.record_own(data);
            let envelope = Envelope::heartbeat(registry.self_id(), data);
            if let Err(e) = log.publish(&envelope).await {
                warn!("💓 Failed to publish heartbeat: {}", e);
            }
        }
        debug!("Heartbeat task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::flaky::FlakyStore;
    use crate::store::MemoryStore;

    fn heartbeat(age_secs: u64, players: usize) -> HeartbeatData {
        HeartbeatData {
            heartbeat: current_timestamp() - age_secs,
            players,
        }
    }

    #[test]
    fn test_registry_splits_live_and_lagged() {
        let registry = ProxyRegistry::new("p1", Duration::from_secs(10));
        registry.record_own(heartbeat(0, 3));
        assert!(registry.observe_heartbeat("p2", heartbeat(1, 5)));
        assert!(!registry.observe_heartbeat("p2", heartbeat(0, 6)));
        registry.observe_heartbeat("p3", heartbeat(30, 7));

        assert_eq!(registry.known_proxies(), vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(registry.lagged_proxies(), vec!["p3".to_string()]);
        assert!(registry.is_alive("p2"));
        assert!(!registry.is_alive("p3"));
        assert!(!registry.is_alive("p4"));
        assert_eq!(registry.total_players(), 9);
    }

    #[test]
    fn test_registry_never_stores_own_id() {
        let registry = ProxyRegistry::new("p1", Duration::from_secs(10));
        assert!(!registry.observe_heartbeat("p1", heartbeat(0, 1)));
        assert!(registry.nodes().is_empty());
        assert!(registry.is_alive("p1"));
    }

    async fn publish_heartbeat(store: &MemoryStore, proxy: &str, age_secs: u64) {
        let envelope = Envelope::heartbeat(proxy, heartbeat(age_secs, 0));
        store
            .append(
                STREAM_KEY,
                &[(stream_fields::PAYLOAD, envelope.encode().unwrap())],
                100,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_guard_aborts_on_recent_heartbeat() {
        let store = MemoryStore::new();
        publish_heartbeat(&store, "p1", 0).await;

        let mut guard = StartupGuard::new("p1", Duration::from_secs(10), None);
        assert_eq!(guard.state(), GuardState::New);
        let result = guard.verify(&store).await;
        assert!(matches!(result, Err(PresenceError::ImpostorDetected(_))));
        assert_eq!(guard.state(), GuardState::Aborted);

        let mut other = StartupGuard::new("p2", Duration::from_secs(10), None);
        other.verify(&store).await.unwrap();
        assert_eq!(other.state(), GuardState::Active);
    }

    #[tokio::test]
    async fn test_guard_accepts_restart_after_death() {
        let store = MemoryStore::new();
        publish_heartbeat(&store, "p1", 0).await;
        let death = Envelope::Death { proxy: "p1".to_string() };
        store
            .append(STREAM_KEY, &[(stream_fields::PAYLOAD, death.encode().unwrap())], 100)
            .await
            .unwrap();

        let mut guard = StartupGuard::new("p1", Duration::from_secs(10), None);
        guard.verify(&store).await.unwrap();
        assert_eq!(guard.state(), GuardState::Active);

        publish_heartbeat(&store, "p1", 0).await;
        let mut second = StartupGuard::new("p1", Duration::from_secs(10), None);
        assert!(second.verify(&store).await.is_err());
    }

    #[tokio::test]
    async fn test_crash_marker_survives_failed_verification() {
        let store = FlakyStore::new(1, 0);
        publish_heartbeat(&store.inner, "p1", 0).await;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("restarted_from_crash.txt");
        std::fs::write(&marker, "").unwrap();

        let mut guard = StartupGuard::new("p1", Duration::from_secs(10), Some(marker.clone()));
        assert!(guard.verify(&store).await.is_err());
        assert_eq!(guard.state(), GuardState::New);
        assert!(marker.exists());

        guard.verify(&store).await.unwrap();
        assert_eq!(guard.state(), GuardState::Active);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_guard_accepts_crash_marker() {
        let store = MemoryStore::new();
        publish_heartbeat(&store, "p1", 0).await;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("restarted_from_crash.txt");
        std::fs::write(&marker, "").unwrap();

        let mut guard = StartupGuard::new("p1", Duration::from_secs(10), Some(marker.clone()));
        guard.verify(&store).await.unwrap();
        assert_eq!(guard.state(), GuardState::Active);
        assert!(!marker.exists());
    }
}
