//! # Local Cache Layer
//!
//! Short-lived, read-through caches in front of the shared store. Each cached
//! attribute has a named loader in [`loaders`], so every store read the cache
//! can make is listed in one place and can be exercised on its own.
//!
//! `last-online` is never cached: it is the authoritative online signal and
//! must not serve a stale "online" after a disconnect.
//!
//! ## Concurrency
//!
//! Entries live in `DashMap`s, so reads and writes from any task are safe
//! without outer locking. Two tasks missing on the same key may both load it;
//! the later insert wins, which is acceptable for data that is only a hint.

use crate::error::StoreResult;
use crate::keys::{fields, KeySpace};
use crate::store::SharedStore;
use crate::types::PlayerId;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Backend server name to the players on it, across the network.
pub type ServerMap = HashMap<String, HashSet<PlayerId>>;

/// A map whose entries expire a fixed time after they were written.
#[derive(Debug)]
pub struct TtlCache<K: Eq + Hash, V> {
    entries: DashMap<K, (V, Instant)>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Returns a live entry, dropping it first if it has expired.
    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            let (value, written) = entry.value();
            if written.elapsed() < self.ttl {
                return Some(value.clone());
            }
        }
        self.entries.remove_if(key, |_, (_, written)| written.elapsed() >= self.ttl);
        None
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(key, (value, Instant::now()));
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the cached value or runs `load` and caches what it finds.
    ///
    /// A loader answering `None` caches nothing, so the next read asks again.
    pub async fn get_or_load<F, Fut, E>(&self, key: K, load: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(Some(value));
        }
        let loaded = load().await?;
        if let Some(value) = &loaded {
            self.insert(key, value.clone());
        }
        Ok(loaded)
    }
}

/// The per-player attributes served through the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerAttribute {
    Server,
    LastServer,
    Proxy,
    Ip,
}

impl PlayerAttribute {
    /// Session hash field backing this attribute.
    pub fn field(self) -> &'static str {
        match self {
            PlayerAttribute::Server => fields::SERVER,
            PlayerAttribute::LastServer => fields::LAST_SERVER,
            PlayerAttribute::Proxy => fields::PROXY,
            PlayerAttribute::Ip => fields::IP,
        }
    }

    /// Loads the attribute from the store through its named loader.
    pub async fn load(self, store: &dyn SharedStore, keys: &KeySpace, uuid: &PlayerId) -> StoreResult<Option<String>> {
        match self {
            PlayerAttribute::Server => loaders::server(store, keys, uuid).await,
            PlayerAttribute::LastServer => loaders::last_server(store, keys, uuid).await,
            PlayerAttribute::Proxy => loaders::proxy(store, keys, uuid).await,
            PlayerAttribute::Ip => loaders::ip(store, keys, uuid).await,
        }
    }
}

/// Store reads performed on a cache miss.
pub mod loaders {
    use super::*;

    async fn session_field(
        store: &dyn SharedStore,
        keys: &KeySpace,
        uuid: &PlayerId,
        field: &str,
    ) -> StoreResult<Option<String>> {
        store.hget(&keys.player_data(uuid), field).await
    }

    pub async fn server(store: &dyn SharedStore, keys: &KeySpace, uuid: &PlayerId) -> StoreResult<Option<String>> {
        session_field(store, keys, uuid, fields::SERVER).await
    }

    pub async fn last_server(store: &dyn SharedStore, keys: &KeySpace, uuid: &PlayerId) -> StoreResult<Option<String>> {
        session_field(store, keys, uuid, fields::LAST_SERVER).await
    }

    pub async fn proxy(store: &dyn SharedStore, keys: &KeySpace, uuid: &PlayerId) -> StoreResult<Option<String>> {
        session_field(store, keys, uuid, fields::PROXY).await
    }

    pub async fn ip(store: &dyn SharedStore, keys: &KeySpace, uuid: &PlayerId) -> StoreResult<Option<String>> {
        session_field(store, keys, uuid, fields::IP).await
    }

    /// Builds the network-wide server map from the online sets of `proxies`.
    ///
    /// Two pipelined round trips: every online set, then the `server` field
    /// of every member. Players not yet on a backend server are left out.
    pub async fn servers_to_players(
        store: &dyn SharedStore,
        keys: &KeySpace,
        proxies: &[String],
    ) -> StoreResult<ServerMap> {
        let set_keys: Vec<String> = proxies.iter().map(|id| keys.online_players(id)).collect();
        let members: Vec<PlayerId> = store
            .smembers_many(&set_keys)
            .await?
            .into_iter()
            .flatten()
            .filter_map(|raw| raw.parse().ok())
            .collect::<HashSet<PlayerId>>()
            .into_iter()
            .collect();

        let requests: Vec<(String, String)> = members
            .iter()
            .map(|uuid| (keys.player_data(uuid), fields::SERVER.to_string()))
            .collect();
        let servers = store.hget_many(&requests).await?;

        let mut map = ServerMap::new();
        for (uuid, server) in members.into_iter().zip(servers) {
            if let Some(server) = server {
                map.entry(server).or_default().insert(uuid);
            }
        }
        Ok(map)
    }
}

/// Every cache of one node.
#[derive(Debug)]
pub struct PresenceCache {
    server: TtlCache<PlayerId, String>,
    last_server: TtlCache<PlayerId, String>,
    proxy: TtlCache<PlayerId, String>,
    ip: TtlCache<PlayerId, String>,
    servers_to_players: TtlCache<(), Arc<ServerMap>>,
}

impl PresenceCache {
    pub fn new(attribute_ttl: Duration, aggregate_ttl: Duration) -> Self {
        Self {
            server: TtlCache::new(attribute_ttl),
            last_server: TtlCache::new(attribute_ttl),
            proxy: TtlCache::new(attribute_ttl),
            ip: TtlCache::new(attribute_ttl),
            servers_to_players: TtlCache::new(aggregate_ttl),
        }
    }

    fn attribute(&self, attribute: PlayerAttribute) -> &TtlCache<PlayerId, String> {
        match attribute {
            PlayerAttribute::Server => &self.server,
            PlayerAttribute::LastServer => &self.last_server,
            PlayerAttribute::Proxy => &self.proxy,
            PlayerAttribute::Ip => &self.ip,
        }
    }

    /// Reads one attribute, loading it from the store on a miss.
    pub async fn get(
        &self,
        attribute: PlayerAttribute,
        store: &dyn SharedStore,
        keys: &KeySpace,
        uuid: &PlayerId,
    ) -> StoreResult<Option<String>> {
        self.attribute(attribute)
            .get_or_load(*uuid, || attribute.load(store, keys, uuid))
            .await
    }

    /// Reads the server map, rebuilding it from `proxies` on a miss.
    pub async fn servers_to_players(
        &self,
        store: &dyn SharedStore,
        keys: &KeySpace,
        proxies: &[String],
    ) -> StoreResult<Arc<ServerMap>> {
        let loaded = self
            .servers_to_players
            .get_or_load((), || async {
                loaders::servers_to_players(store, keys, proxies)
                    .await
                    .map(|map| Some(Arc::new(map)))
            })
            .await?;
        Ok(loaded.unwrap_or_default())
    }

    /// A player moved between backend servers.
    pub fn on_server_change(&self, uuid: &PlayerId) {
        self.server.invalidate(uuid);
        self.last_server.invalidate(uuid);
        self.servers_to_players.invalidate_all();
    }

    /// A player connected somewhere; drop leftovers of an earlier session.
    pub fn on_join(&self, uuid: &PlayerId) {
        self.proxy.invalidate(uuid);
        self.ip.invalidate(uuid);
    }

    /// A player left the network.
    pub fn on_leave(&self, uuid: &PlayerId) {
        self.server.invalidate(uuid);
        self.proxy.invalidate(uuid);
        self.ip.invalidate(uuid);
        self.servers_to_players.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, WriteBatch};

    #[tokio::test]
    async fn test_entries_expire() {
        let cache: TtlCache<u32, String> = TtlCache::new(Duration::from_millis(20));
        cache.insert(1, "one".to_string());
        assert_eq!(cache.get(&1).as_deref(), Some("one"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_absent_values_are_not_cached() {
        let cache: TtlCache<u32, String> = TtlCache::new(Duration::from_secs(60));
        let first: Result<_, ()> = cache.get_or_load(1, || async { Ok(None) }).await;
        assert_eq!(first, Ok(None));
        let second: Result<_, ()> = cache.get_or_load(1, || async { Ok(Some("now".to_string())) }).await;
        assert_eq!(second, Ok(Some("now".to_string())));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_server_change_invalidates_server_fields() {
        let store = MemoryStore::new();
        let keys = KeySpace::new("main");
        let cache = PresenceCache::new(Duration::from_secs(60), Duration::from_secs(60));
        let uuid = PlayerId::new();

        store
            .apply(WriteBatch::new().hset(keys.player_data(&uuid), "server", "lobby"))
            .await
            .unwrap();
        let first = cache.get(PlayerAttribute::Server, &store, &keys, &uuid).await.unwrap();
        assert_eq!(first.as_deref(), Some("lobby"));

        store
            .apply(WriteBatch::new().hset(keys.player_data(&uuid), "server", "survival"))
            .await
            .unwrap();
        let cached = cache.get(PlayerAttribute::Server, &store, &keys, &uuid).await.unwrap();
        assert_eq!(cached.as_deref(), Some("lobby"));

        cache.on_server_change(&uuid);
        let fresh = cache.get(PlayerAttribute::Server, &store, &keys, &uuid).await.unwrap();
        assert_eq!(fresh.as_deref(), Some("survival"));
    }

    #[tokio::test]
    async fn test_servers_to_players_loader() {
        let store = MemoryStore::new();
        let keys = KeySpace::new("main");
        let (a, b, c) = (PlayerId::new(), PlayerId::new(), PlayerId::new());

        store
            .apply(
                WriteBatch::new()
                    .sadd(keys.online_players("p1"), [a.to_string(), b.to_string()])
                    .sadd(keys.online_players("p2"), [c.to_string()])
                    .hset(keys.player_data(&a), "server", "lobby")
                    .hset(keys.player_data(&c), "server", "lobby"),
            )
            .await
            .unwrap();

        let proxies = vec!["p1".to_string(), "p2".to_string()];
        let map = loaders::servers_to_players(&store, &keys, &proxies).await.unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map["lobby"], HashSet::from([a, c]));
    }
}
