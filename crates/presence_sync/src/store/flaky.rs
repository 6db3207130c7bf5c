//! [`SharedStore`] wrapper that fails a set number of calls before passing
//! through to a [`MemoryStore`].

use super::{ChannelMessage, MemoryStore, SharedStore, StreamCursor, StreamEntry, WriteBatch};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub(crate) struct FlakyStore {
    pub inner: MemoryStore,
    /// Stream reads and clock calls still to fail
    pub read_failures: AtomicUsize,
    /// Subscriptions still to fail
    pub subscribe_failures: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(read_failures: usize, subscribe_failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            read_failures: AtomicUsize::new(read_failures),
            subscribe_failures: AtomicUsize::new(subscribe_failures),
            subscribe_calls: AtomicUsize::new(0),
        }
    }

    fn trip(counter: &AtomicUsize) -> StoreResult<()> {
        let failed = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            Err(StoreError::Connection("connection reset by peer".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedStore for FlakyStore {
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.inner.hget(key, field).await
    }

    async fn hget_many(&self, requests: &[(String, String)]) -> StoreResult<Vec<Option<String>>> {
        self.inner.hget_many(requests).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.inner.hgetall(key).await
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        self.inner.hlen(key).await
    }

    async fn smembers(&self, key: &str) -> StoreResult<HashSet<String>> {
        self.inner.smembers(key).await
    }

    async fn smembers_many(&self, keys: &[String]) -> StoreResult<Vec<HashSet<String>>> {
        self.inner.smembers_many(keys).await
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.sismember(key, member).await
    }

    async fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        self.inner.apply(batch).await
    }

    async fn append(&self, stream: &str, fields: &[(&str, String)], max_len: usize) -> StoreResult<String> {
        self.inner.append(stream, fields, max_len).await
    }

    async fn read_after(&self, stream: &str, cursor: &StreamCursor) -> StoreResult<Vec<StreamEntry>> {
        Self::trip(&self.read_failures)?;
        self.inner.read_after(stream, cursor).await
    }

    async fn read_recent(&self, stream: &str, since_millis: u64) -> StoreResult<Vec<StreamEntry>> {
        Self::trip(&self.read_failures)?;
        self.inner.read_recent(stream, since_millis).await
    }

    async fn time_millis(&self) -> StoreResult<u64> {
        Self::trip(&self.read_failures)?;
        self.inner.time_millis().await
    }

    async fn server_version(&self) -> StoreResult<String> {
        self.inner.server_version().await
    }

    async fn subscribe(&self, channels: &[&str]) -> StoreResult<BoxStream<'static, StoreResult<ChannelMessage>>> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Self::trip(&self.subscribe_failures)?;
        self.inner.subscribe(channels).await
    }
}
