//! # Shared Store Client
//!
//! The single seam between the presence engine and the shared coordination
//! store. Every component talks to the store through [`SharedStore`], so the
//! engine runs unchanged against a real Redis-compatible server
//! ([`RedisStore`]) or the in-process [`MemoryStore`] used by tests and
//! single-node development.
//!
//! ## Write batching
//!
//! Multi-key writes are collected into a [`WriteBatch`] and sent in one round
//! trip. A batch is *not* atomic: a partial failure leaves an inconsistency
//! that the reconciliation pass repairs.
//!
//! ## Blocking calls
//!
//! [`SharedStore::read_after`] blocks until new stream entries exist and
//! [`SharedStore::subscribe`] yields messages until the connection drops.
//! Implementations run both on connections of their own so that request /
//! response traffic is never queued behind them.

#[cfg(test)]
pub(crate) mod flaky;
mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::error::StoreResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::{HashMap, HashSet};

/// One entry of the ordered event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Store-assigned id, monotonically increasing within a stream
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Position from which a blocking stream read continues.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamCursor {
    /// Only entries appended after the read started
    #[default]
    Latest,
    /// Entries strictly after this id
    After(String),
}

/// A message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HashDel {
        key: String,
        fields: Vec<String>,
    },
    SetAdd {
        key: String,
        members: Vec<String>,
    },
    SetRemove {
        key: String,
        members: Vec<String>,
    },
    Delete {
        key: String,
    },
    Publish {
        channel: String,
        payload: String,
    },
}

/// Ordered list of writes sent to the store in one round trip.
///
/// Operations with nothing to write (an empty field or member list) are
/// dropped when they are added, since the store rejects them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<StoreOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hset(self, key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.hset_many(key, vec![(field.into(), value.into())])
    }

    pub fn hset_many(mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        if !fields.is_empty() {
            self.ops.push(StoreOp::HashSet {
                key: key.into(),
                fields,
            });
        }
        self
    }

    pub fn hdel<I, S>(mut self, key: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if !fields.is_empty() {
            self.ops.push(StoreOp::HashDel {
                key: key.into(),
                fields,
            });
        }
        self
    }

    pub fn sadd<I, S>(mut self, key: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members: Vec<String> = members.into_iter().map(Into::into).collect();
        if !members.is_empty() {
            self.ops.push(StoreOp::SetAdd {
                key: key.into(),
                members,
            });
        }
        self
    }

    pub fn srem<I, S>(mut self, key: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members: Vec<String> = members.into_iter().map(Into::into).collect();
        if !members.is_empty() {
            self.ops.push(StoreOp::SetRemove {
                key: key.into(),
                members,
            });
        }
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.ops.push(StoreOp::Delete { key: key.into() });
        self
    }

    pub fn publish(mut self, channel: impl Into<String>, payload: impl Into<String>) -> Self {
        self.ops.push(StoreOp::Publish {
            channel: channel.into(),
            payload: payload.into(),
        });
        self
    }

    /// Appends every operation of `other` after the ones already queued.
    pub fn extend(mut self, other: WriteBatch) -> Self {
        self.ops.extend(other.ops);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }
}

/// Client interface of the shared coordination store.
///
/// All methods are request/response except [`read_after`](Self::read_after)
/// and [`subscribe`](Self::subscribe). A missing key reads as an empty
/// collection or `None`, never as an error.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Reads one hash field.
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Reads many `(key, field)` pairs in one round trip, answers in order.
    async fn hget_many(&self, requests: &[(String, String)]) -> StoreResult<Vec<Option<String>>>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Number of fields in a hash.
    async fn hlen(&self, key: &str) -> StoreResult<usize>;

    async fn smembers(&self, key: &str) -> StoreResult<HashSet<String>>;

    /// Reads many sets in one round trip, answers in order.
    async fn smembers_many(&self, keys: &[String]) -> StoreResult<Vec<HashSet<String>>>;

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Sends every operation of the batch in one round trip.
    async fn apply(&self, batch: WriteBatch) -> StoreResult<()>;

    /// Appends an entry to `stream`, trimming it to about `max_len` entries.
    ///
    /// # Returns
    ///
    /// The id the store assigned to the new entry.
    async fn append(&self, stream: &str, fields: &[(&str, String)], max_len: usize) -> StoreResult<String>;

    /// Blocks until at least one entry exists after `cursor`, then returns
    /// every such entry in stream order.
    async fn read_after(&self, stream: &str, cursor: &StreamCursor) -> StoreResult<Vec<StreamEntry>>;

    /// Returns entries appended at or after `since_millis` (store clock),
    /// newest first, without blocking.
    async fn read_recent(&self, stream: &str, since_millis: u64) -> StoreResult<Vec<StreamEntry>>;

    /// Current time according to the store, in unix milliseconds.
    async fn time_millis(&self) -> StoreResult<u64>;

    /// Version string reported by the store, e.g. `"7.2.4"`.
    async fn server_version(&self) -> StoreResult<String>;

    /// Subscribes to `channels` on a connection of its own.
    ///
    /// The returned stream ends or yields an error when the connection is
    /// lost; callers resubscribe after a backoff.
    async fn subscribe(&self, channels: &[&str]) -> StoreResult<BoxStream<'static, StoreResult<ChannelMessage>>>;
}

/// Parses a `major.minor[.patch]` version string.
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map(|p| p.parse().ok()).unwrap_or(Some(0))?;
    Some((major, minor))
}

/// Whether a store reporting `version` supports capped streams.
pub fn supports_streams(version: &str) -> bool {
    parse_version(version).is_some_and(|v| v >= (6, 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_skips_empty_operations() {
        let batch = WriteBatch::new()
            .sadd("set", Vec::<String>::new())
            .hdel("hash", Vec::<String>::new())
            .hset("hash", "field", "value")
            .publish("channel", "payload");
        assert_eq!(batch.len(), 2);
        assert!(matches!(batch.ops()[0], StoreOp::HashSet { .. }));
    }

    #[test]
    fn test_supports_streams() {
        assert!(supports_streams("6.2.0"));
        assert!(supports_streams("7.0.15"));
        assert!(!supports_streams("6.0.9"));
        assert!(!supports_streams("5"));
        assert!(!supports_streams("garbage"));
    }
}
