//! # UUID Translator
//!
//! Bidirectional name ↔ uuid cache. Lookups try the cheapest source first
//! and only fall back to the external profile service when the caller allows
//! expensive lookups and the network runs in online mode.
//!
//! ## Resolution order for [`UuidTranslator::resolve_uuid`]
//!
//! 1. a player with that name connected to this proxy
//! 2. the local cache
//! 3. input that already is a uuid, dashed or undashed
//! 4. offline mode only: the deterministic `OfflinePlayer:<name>` uuid,
//!    computed without any store or network access and never persisted
//! 5. the shared `uuid-cache` hash (expired entries are deleted)
//! 6. the profile service, persisted on success
//!
//! Every persisted entry is written under both the lowercase name and the
//! uuid string with an identical payload.

use crate::error::PresenceError;
use crate::keys::UUID_CACHE_KEY;
use crate::platform::ProxyPlatform;
use crate::profile::ProfileLookup;
use crate::store::{SharedStore, WriteBatch};
use crate::types::PlayerId;
use crate::utils::current_timestamp_millis;
use dashmap::DashMap;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One name ↔ uuid association as stored in `uuid-cache`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedUuidEntry {
    pub name: String,
    pub uuid: PlayerId,
    /// Unix milliseconds after which the entry is stale
    pub expiry: u64,
}

impl CachedUuidEntry {
    pub fn new(name: impl Into<String>, uuid: PlayerId, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            uuid,
            expiry: current_timestamp_millis() + ttl.as_millis() as u64,
        }
    }

    pub fn is_expired(&self) -> bool {
        current_timestamp_millis() >= self.expiry
    }
}

/// The uuid an offline-mode server assigns to `name`.
///
/// A version 3 uuid over the MD5 of `OfflinePlayer:<name>`, matching what
/// offline-mode backends compute, so it is stable across processes.
pub fn offline_uuid(name: &str) -> PlayerId {
    let digest = Md5::digest(format!("OfflinePlayer:{name}").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest);
    PlayerId(uuid::Builder::from_md5_bytes(bytes).into_uuid())
}

pub struct UuidTranslator {
    store: Arc<dyn SharedStore>,
    platform: Arc<dyn ProxyPlatform>,
    lookup: Option<Arc<dyn ProfileLookup>>,
    online_mode: bool,
    ttl: Duration,
    by_name: DashMap<String, CachedUuidEntry>,
    by_uuid: DashMap<PlayerId, CachedUuidEntry>,
}

impl UuidTranslator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        platform: Arc<dyn ProxyPlatform>,
        lookup: Option<Arc<dyn ProfileLookup>>,
        online_mode: bool,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            platform,
            lookup,
            online_mode,
            ttl,
            by_name: DashMap::new(),
            by_uuid: DashMap::new(),
        }
    }

    fn remember(&self, entry: CachedUuidEntry) {
        self.by_name.insert(entry.name.to_lowercase(), entry.clone());
        self.by_uuid.insert(entry.uuid, entry);
    }

    fn cached_by_name(&self, key: &str) -> Option<PlayerId> {
        let entry = self.by_name.get(key)?;
        if !entry.is_expired() {
            return Some(entry.uuid);
        }
        drop(entry);
        self.by_name.remove(key);
        None
    }

    fn cached_by_uuid(&self, uuid: &PlayerId) -> Option<String> {
        let entry = self.by_uuid.get(uuid)?;
        if !entry.is_expired() {
            return Some(entry.name.clone());
        }
        drop(entry);
        self.by_uuid.remove(uuid);
        None
    }

    /// Reads and validates a `uuid-cache` field, deleting it if expired.
    async fn stored_entry(&self, field: &str) -> Result<Option<CachedUuidEntry>, PresenceError> {
        let Some(raw) = self.store.hget(UUID_CACHE_KEY, field).await? else {
            return Ok(None);
        };
        let entry: CachedUuidEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Dropping unreadable uuid-cache entry '{}': {}", field, e);
                self.store.apply(WriteBatch::new().hdel(UUID_CACHE_KEY, [field])).await?;
                return Ok(None);
            }
        };
        if entry.is_expired() {
            debug!("uuid-cache entry for {} expired", entry.name);
            let batch = WriteBatch::new().hdel(
                UUID_CACHE_KEY,
                [field.to_string(), entry.name.to_lowercase(), entry.uuid.to_string()],
            );
            self.store.apply(batch).await?;
            return Ok(None);
        }
        self.remember(entry.clone());
        Ok(Some(entry))
    }

    /// Resolves a player name (or a uuid string) to a uuid.
    ///
    /// # Arguments
    ///
    /// * `name` - Player name, matched case-insensitively, or a uuid string
    /// * `expensive` - Whether the external profile service may be asked
    ///
    /// # Returns
    ///
    /// `Ok(None)` when no source knows the name. Store failures are errors;
    /// a failing profile service only degrades to `None`.
    pub async fn resolve_uuid(&self, name: &str, expensive: bool) -> Result<Option<PlayerId>, PresenceError> {
        if let Some(player) = self.platform.local_player_by_name(name) {
            return Ok(Some(player.uuid));
        }

        let key = name.to_lowercase();
        if let Some(uuid) = self.cached_by_name(&key) {
            return Ok(Some(uuid));
        }

        if let Some(uuid) = PlayerId::parse_any(name) {
            return Ok(Some(uuid));
        }

        if !self.online_mode {
            return Ok(Some(offline_uuid(name)));
        }

        if let Some(entry) = self.stored_entry(&key).await? {
            return Ok(Some(entry.uuid));
        }

        if !expensive {
            return Ok(None);
        }
        let Some(lookup) = &self.lookup else {
            return Ok(None);
        };
        match lookup.profiles_for_names(&[name.to_string()]).await {
            Ok(profiles) => {
                let Some(profile) = profiles.into_iter().find(|p| p.name.eq_ignore_ascii_case(name)) else {
                    return Ok(None);
                };
                self.persist(&profile.name, profile.uuid).await?;
                Ok(Some(profile.uuid))
            }
            Err(e) => {
                warn!("Unable to fetch uuid for {} from the profile service: {}", name, e);
                Ok(None)
            }
        }
    }

    /// Resolves a uuid to the player's name.
    ///
    /// Mirrors [`resolve_uuid`](Self::resolve_uuid) without the offline
    /// derivation, since a name cannot be derived from a uuid.
    pub async fn resolve_name(&self, uuid: &PlayerId, expensive: bool) -> Result<Option<String>, PresenceError> {
        if let Some(player) = self.platform.local_player(uuid) {
            return Ok(Some(player.name));
        }

        if let Some(name) = self.cached_by_uuid(uuid) {
            return Ok(Some(name));
        }

        if let Some(entry) = self.stored_entry(&uuid.to_string()).await? {
            return Ok(Some(entry.name));
        }

        if !expensive || !self.online_mode {
            return Ok(None);
        }
        let Some(lookup) = &self.lookup else {
            return Ok(None);
        };
        match lookup.name_for_uuid(uuid).await {
            Ok(Some(name)) => {
                self.persist(&name, *uuid).await?;
                Ok(Some(name))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!("Unable to fetch name for {} from the profile service: {}", uuid, e);
                Ok(None)
            }
        }
    }

    /// Caches `name` ↔ `uuid` locally and in the store under both keys.
    pub async fn persist(&self, name: &str, uuid: PlayerId) -> Result<(), PresenceError> {
        self.store.apply(self.persist_batch(name, uuid)?).await?;
        Ok(())
    }

    /// Caches the association locally and returns the store writes for it,
    /// so callers can send them together with other writes.
    pub fn persist_batch(&self, name: &str, uuid: PlayerId) -> Result<WriteBatch, PresenceError> {
        let entry = CachedUuidEntry::new(name, uuid, self.ttl);
        let json = serde_json::to_string(&entry)?;
        self.remember(entry);
        Ok(WriteBatch::new().hset_many(
            UUID_CACHE_KEY,
            vec![(name.to_lowercase(), json.clone()), (uuid.to_string(), json)],
        ))
    }

    /// Deletes every expired or unreadable field of `uuid-cache`.
    ///
    /// # Returns
    ///
    /// The number of fields removed.
    pub async fn purge_expired(&self) -> Result<usize, PresenceError> {
        let stored = self.store.hgetall(UUID_CACHE_KEY).await?;
        let stale: Vec<String> = stored
            .into_iter()
            .filter(|(_, raw)| {
                serde_json::from_str::<CachedUuidEntry>(raw)
                    .map(|entry| entry.is_expired())
                    .unwrap_or(true)
            })
            .map(|(field, _)| field)
            .collect();

        self.by_name.retain(|_, entry| !entry.is_expired());
        self.by_uuid.retain(|_, entry| !entry.is_expired());

        let removed = stale.len();
        if removed > 0 {
            self.store.apply(WriteBatch::new().hdel(UUID_CACHE_KEY, stale)).await?;
            info!("🧹 Removed {} expired uuid-cache entries", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LookupError;
    use crate::platform::RosterPlatform;
    use crate::profile::Profile;
    use crate::store::MemoryStore;
    use crate::types::LocalPlayer;
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedLookup {
        profile: Profile,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProfileLookup for FixedLookup {
        async fn profiles_for_names(&self, names: &[String]) -> Result<Vec<Profile>, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(names
                .iter()
                .filter(|n| n.eq_ignore_ascii_case(&self.profile.name))
                .map(|_| self.profile.clone())
                .collect())
        }

        async fn name_for_uuid(&self, uuid: &PlayerId) -> Result<Option<String>, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((*uuid == self.profile.uuid).then(|| self.profile.name.clone()))
        }
    }

    fn translator(store: Arc<MemoryStore>, lookup: Option<Arc<FixedLookup>>, online: bool) -> UuidTranslator {
        UuidTranslator::new(
            store,
            Arc::new(RosterPlatform::new()),
            lookup.map(|l| l as Arc<dyn ProfileLookup>),
            online,
            Duration::from_secs(3 * 24 * 3600),
        )
    }

    #[test]
    fn test_offline_uuid_is_deterministic_v3() {
        let first = offline_uuid("Steve");
        assert_eq!(first, offline_uuid("Steve"));
        assert_ne!(first, offline_uuid("steve"));
        assert_eq!(first.0.get_version_num(), 3);
    }

    #[tokio::test]
    async fn test_offline_mode_needs_no_store() {
        let store = Arc::new(MemoryStore::new());
        let translator = translator(store.clone(), None, false);
        let uuid = translator.resolve_uuid("Steve", true).await.unwrap();
        assert_eq!(uuid, Some(offline_uuid("Steve")));
        assert!(!store.contains_key(UUID_CACHE_KEY));
    }

    #[tokio::test]
    async fn test_uuid_shaped_input() {
        let translator = translator(Arc::new(MemoryStore::new()), None, true);
        let expected: PlayerId = "069a79f4-44e9-4726-a5be-fca90e38aaf5".parse().unwrap();
        assert_eq!(
            translator.resolve_uuid("069a79f444e94726a5befca90e38aaf5", false).await.unwrap(),
            Some(expected)
        );
    }

    #[tokio::test]
    async fn test_local_player_wins() {
        let platform = Arc::new(RosterPlatform::new());
        let uuid = PlayerId::new();
        platform.connect(LocalPlayer {
            uuid,
            name: "Alex".to_string(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server: None,
        });
        let translator = UuidTranslator::new(
            Arc::new(MemoryStore::new()),
            platform,
            None,
            true,
            Duration::from_secs(60),
        );
        assert_eq!(translator.resolve_uuid("alex", false).await.unwrap(), Some(uuid));
        assert_eq!(translator.resolve_name(&uuid, false).await.unwrap().as_deref(), Some("Alex"));
    }

    #[tokio::test]
    async fn test_external_lookup_is_persisted_under_both_keys() {
        let store = Arc::new(MemoryStore::new());
        let profile = Profile {
            uuid: PlayerId::new(),
            name: "Notch".to_string(),
        };
        let lookup = Arc::new(FixedLookup {
            profile: profile.clone(),
            calls: AtomicUsize::new(0),
        });
        let first = translator(store.clone(), Some(lookup.clone()), true);

        assert_eq!(first.resolve_uuid("notch", false).await.unwrap(), None);
        assert_eq!(first.resolve_uuid("notch", true).await.unwrap(), Some(profile.uuid));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

        let by_name = store.hget(UUID_CACHE_KEY, "notch").await.unwrap();
        let by_uuid = store.hget(UUID_CACHE_KEY, &profile.uuid.to_string()).await.unwrap();
        assert!(by_name.is_some());
        assert_eq!(by_name, by_uuid);

        // A second process finds it in the store without asking the service.
        let second = translator(store.clone(), Some(lookup.clone()), true);
        assert_eq!(second.resolve_uuid("NOTCH", true).await.unwrap(), Some(profile.uuid));
        assert_eq!(second.resolve_name(&profile.uuid, true).await.unwrap().as_deref(), Some("Notch"));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_store_entries_are_removed() {
        let store = Arc::new(MemoryStore::new());
        let uuid = PlayerId::new();
        let stale = CachedUuidEntry {
            name: "Old".to_string(),
            uuid,
            expiry: 1,
        };
        let json = serde_json::to_string(&stale).unwrap();
        store
            .apply(WriteBatch::new().hset_many(
                UUID_CACHE_KEY,
                vec![("old".to_string(), json.clone()), (uuid.to_string(), json)],
            ))
            .await
            .unwrap();

        let translator = translator(store.clone(), None, true);
        assert_eq!(translator.resolve_uuid("Old", false).await.unwrap(), None);
        assert!(!store.contains_key(UUID_CACHE_KEY));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = Arc::new(MemoryStore::new());
        let translator = translator(store.clone(), None, true);
        translator.persist("Fresh", PlayerId::new()).await.unwrap();

        let stale = serde_json::to_string(&CachedUuidEntry {
            name: "Old".to_string(),
            uuid: PlayerId::new(),
            expiry: 1,
        })
        .unwrap();
        store
            .apply(
                WriteBatch::new()
                    .hset(UUID_CACHE_KEY, "old", stale)
                    .hset(UUID_CACHE_KEY, "broken", "{"),
            )
            .await
            .unwrap();

        assert_eq!(translator.purge_expired().await.unwrap(), 2);
        assert_eq!(store.hlen(UUID_CACHE_KEY).await.unwrap(), 2);
    }
}
