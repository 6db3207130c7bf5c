//! In-process [`SharedStore`] for tests and single-node development.
//!
//! Hashes and sets live in `DashMap`s, streams behind an async mutex with a
//! `watch` counter that wakes blocked readers, and pub/sub is a single
//! broadcast channel filtered per subscriber. Empty hashes and sets are
//! removed, matching how the real store treats them.

use super::{ChannelMessage, SharedStore, StoreOp, StreamCursor, StreamEntry, WriteBatch};
use crate::error::{StoreError, StoreResult};
use crate::utils::current_timestamp_millis;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
struct EntryId {
    millis: u64,
    seq: u64,
}

impl EntryId {
    fn parse(raw: &str) -> StoreResult<Self> {
        let (millis, seq) = raw.split_once('-').unwrap_or((raw, "0"));
        match (millis.parse(), seq.parse()) {
            (Ok(millis), Ok(seq)) => Ok(Self { millis, seq }),
            _ => Err(StoreError::Response(format!("invalid stream id '{raw}'"))),
        }
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

#[derive(Default)]
struct StreamLog {
    last_id: EntryId,
    entries: Vec<(EntryId, HashMap<String, String>)>,
}

impl StreamLog {
    fn after(&self, id: EntryId) -> Vec<StreamEntry> {
        self.entries
            .iter()
            .filter(|(entry_id, _)| *entry_id > id)
            .map(|(entry_id, fields)| StreamEntry {
                id: entry_id.to_string(),
                fields: fields.clone(),
            })
            .collect()
    }
}

pub struct MemoryStore {
    hashes: DashMap<String, HashMap<String, String>>,
    sets: DashMap<String, HashSet<String>>,
    streams: Mutex<HashMap<String, StreamLog>>,
    appended: watch::Sender<u64>,
    channels: broadcast::Sender<ChannelMessage>,
    version: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_version("7.2.0")
    }

    /// Creates a store that reports `version` from `server_version`.
    pub fn with_version(version: impl Into<String>) -> Self {
        let (appended, _) = watch::channel(0);
        let (channels, _) = broadcast::channel(1024);
        Self {
            hashes: DashMap::new(),
            sets: DashMap::new(),
            streams: Mutex::new(HashMap::new()),
            appended,
            channels,
            version: version.into(),
        }
    }

    /// Whether a hash or set is stored under `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.hashes.contains_key(key) || self.sets.contains_key(key)
    }

    fn apply_op(&self, op: StoreOp) {
        match op {
            StoreOp::HashSet { key, fields } => {
                self.hashes.entry(key).or_default().extend(fields);
            }
            StoreOp::HashDel { key, fields } => {
                if let Some(mut hash) = self.hashes.get_mut(&key) {
                    for field in &fields {
                        hash.remove(field);
                    }
                }
                self.hashes.remove_if(&key, |_, hash| hash.is_empty());
            }
            StoreOp::SetAdd { key, members } => {
                self.sets.entry(key).or_default().extend(members);
            }
            StoreOp::SetRemove { key, members } => {
                if let Some(mut set) = self.sets.get_mut(&key) {
                    for member in &members {
                        set.remove(member);
                    }
                }
                self.sets.remove_if(&key, |_, set| set.is_empty());
            }
            StoreOp::Delete { key } => {
                self.hashes.remove(&key);
                self.sets.remove(&key);
            }
            StoreOp::Publish { channel, payload } => {
                // No subscribers is not an error for pub/sub.
                let _ = self.channels.send(ChannelMessage { channel, payload });
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self.hashes.get(key).and_then(|hash| hash.get(field).cloned()))
    }

    async fn hget_many(&self, requests: &[(String, String)]) -> StoreResult<Vec<Option<String>>> {
        let mut values = Vec::with_capacity(requests.len());
        for (key, field) in requests {
            values.push(self.hget(key, field).await?);
        }
        Ok(values)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self.hashes.get(key).map(|hash| hash.clone()).unwrap_or_default())
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        Ok(self.hashes.get(key).map(|hash| hash.len()).unwrap_or(0))
    }

    async fn smembers(&self, key: &str) -> StoreResult<HashSet<String>> {
        Ok(self.sets.get(key).map(|set| set.clone()).unwrap_or_default())
    }

    async fn smembers_many(&self, keys: &[String]) -> StoreResult<Vec<HashSet<String>>> {
        let mut sets = Vec::with_capacity(keys.len());
        for key in keys {
            sets.push(self.smembers(key).await?);
        }
        Ok(sets)
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self.sets.get(key).is_some_and(|set| set.contains(member)))
    }

    async fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        for op in batch.into_ops() {
            self.apply_op(op);
        }
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(&str, String)], max_len: usize) -> StoreResult<String> {
        let id = {
            let mut streams = self.streams.lock().await;
            let log = streams.entry(stream.to_string()).or_default();
            let now = current_timestamp_millis();
            let id = if now > log.last_id.millis {
                EntryId { millis: now, seq: 0 }
            } else {
                EntryId {
                    millis: log.last_id.millis,
                    seq: log.last_id.seq + 1,
                }
            };
            log.last_id = id;
            log.entries.push((
                id,
                fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            ));
            if log.entries.len() > max_len {
                let excess = log.entries.len() - max_len;
                log.entries.drain(..excess);
            }
            id
        };
        self.appended.send_modify(|count| *count += 1);
        Ok(id.to_string())
    }

    async fn read_after(&self, stream: &str, cursor: &StreamCursor) -> StoreResult<Vec<StreamEntry>> {
        // Subscribe before the first look so an append in between still wakes us.
        let mut appended = self.appended.subscribe();
        let after = match cursor {
            StreamCursor::Latest => self
                .streams
                .lock()
                .await
                .get(stream)
                .map(|log| log.last_id)
                .unwrap_or_default(),
            StreamCursor::After(id) => EntryId::parse(id)?,
        };

        loop {
            let entries = self
                .streams
                .lock()
                .await
                .get(stream)
                .map(|log| log.after(after))
                .unwrap_or_default();
            if !entries.is_empty() {
                return Ok(entries);
            }
            if appended.changed().await.is_err() {
                return Err(StoreError::Connection("memory store closed".to_string()));
            }
        }
    }

    async fn read_recent(&self, stream: &str, since_millis: u64) -> StoreResult<Vec<StreamEntry>> {
        let streams = self.streams.lock().await;
        let Some(log) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(log
            .entries
            .iter()
            .rev()
            .take_while(|(id, _)| id.millis >= since_millis)
            .map(|(id, fields)| StreamEntry {
                id: id.to_string(),
                fields: fields.clone(),
            })
            .collect())
    }

    async fn time_millis(&self) -> StoreResult<u64> {
        Ok(current_timestamp_millis())
    }

    async fn server_version(&self) -> StoreResult<String> {
        Ok(self.version.clone())
    }

    async fn subscribe(&self, channels: &[&str]) -> StoreResult<BoxStream<'static, StoreResult<ChannelMessage>>> {
        let wanted: Arc<HashSet<String>> = Arc::new(channels.iter().map(|c| c.to_string()).collect());
        let receiver = self.channels.subscribe();

        let messages = stream::unfold(receiver, move |mut receiver| {
            let wanted = Arc::clone(&wanted);
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(msg) if wanted.contains(&msg.channel) => return Some((Ok(msg), receiver)),
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Memory subscriber lagged, {} message(s) dropped", skipped);
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(messages.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_empty_collections_disappear() {
        let store = MemoryStore::new();
        store
            .apply(WriteBatch::new().sadd("set", ["a"]).hset("hash", "f", "v"))
            .await
            .unwrap();
        assert!(store.contains_key("set"));

        store
            .apply(WriteBatch::new().srem("set", ["a"]).hdel("hash", ["f"]))
            .await
            .unwrap();
        assert!(!store.contains_key("set"));
        assert!(!store.contains_key("hash"));
        assert_eq!(store.hget("hash", "f").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stream_ids_increase_and_cap_applies() {
        let store = MemoryStore::new();
        let mut last = String::new();
        for i in 0..5 {
            let id = store.append("s", &[("n", i.to_string())], 3).await.unwrap();
            if !last.is_empty() {
                assert!(EntryId::parse(&id).unwrap() > EntryId::parse(&last).unwrap());
            }
            last = id;
        }
        let entries = store.read_after("s", &StreamCursor::After("0-0".to_string())).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].field("n"), Some("2"));

        let recent = store.read_recent("s", 0).await.unwrap();
        assert_eq!(recent[0].field("n"), Some("4"));
    }

    #[tokio::test]
    async fn test_latest_read_waits_for_new_entries() {
        let store = Arc::new(MemoryStore::new());
        store.append("s", &[("n", "old".to_string())], 10).await.unwrap();

        let reader = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.read_after("s", &StreamCursor::Latest).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append("s", &[("n", "new".to_string())], 10).await.unwrap();

        let entries = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field("n"), Some("new"));
    }

    #[tokio::test]
    async fn test_subscribe_filters_channels() {
        let store = MemoryStore::new();
        let mut messages = store.subscribe(&["wanted"]).await.unwrap();
        store
            .apply(WriteBatch::new().publish("other", "x").publish("wanted", "y"))
            .await
            .unwrap();

        let msg = messages.next().await.unwrap().unwrap();
        assert_eq!(msg.channel, "wanted");
        assert_eq!(msg.payload, "y");
    }
}
