//! [`SharedStore`] over a Redis-compatible server.
//!
//! Request/response traffic shares one multiplexed connection. The blocking
//! stream read gets a dedicated connection that is re-established after any
//! failure, and every subscription opens its own pub/sub connection.

use super::{ChannelMessage, SharedStore, StoreOp, StreamCursor, StreamEntry, WriteBatch};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
    blocking: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    /// Opens the shared request/response connection.
    ///
    /// # Arguments
    ///
    /// * `url` - Connection url, e.g. `redis://:password@127.0.0.1:6379/0`
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("🔗 Connected to shared store at {}", redact_url(url));
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(None),
        })
    }

    async fn blocking_connection(&self) -> StoreResult<MultiplexedConnection> {
        let mut guard = self.blocking.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!("Opened dedicated stream connection");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_blocking_connection(&self) {
        self.blocking.lock().await.take();
    }
}

fn redact_url(url: &str) -> &str {
    match url.rfind('@') {
        Some(at) => &url[at + 1..],
        None => url,
    }
}

fn to_entry(raw: StreamId) -> StoreResult<StreamEntry> {
    let mut fields = HashMap::with_capacity(raw.map.len());
    for (name, value) in raw.map {
        let value: String = redis::from_redis_value(&value)
            .map_err(|e| StoreError::Decode(format!("stream field '{name}': {e}")))?;
        fields.insert(name, value);
    }
    Ok(StreamEntry { id: raw.id, fields })
}

/// Extracts `redis_version` from an `INFO server` reply.
fn version_from_info(info: &str) -> Option<String> {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("redis_version:"))
        .map(|v| v.trim().to_string())
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hget_many(&self, requests: &[(String, String)]) -> StoreResult<Vec<Option<String>>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for (key, field) in requests {
            pipe.cmd("HGET").arg(key).arg(field);
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        Ok(values)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let values: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(values)
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.hlen(key).await?;
        Ok(len)
    }

    async fn smembers(&self, key: &str) -> StoreResult<HashSet<String>> {
        let mut conn = self.conn.clone();
        let members: HashSet<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn smembers_many(&self, keys: &[String]) -> StoreResult<Vec<HashSet<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("SMEMBERS").arg(key);
        }
        let mut conn = self.conn.clone();
        let sets: Vec<HashSet<String>> = pipe.query_async(&mut conn).await?;
        Ok(sets)
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let present: bool = conn.sismember(key, member).await?;
        Ok(present)
    }

    async fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for op in batch.into_ops() {
            match op {
                StoreOp::HashSet { key, fields } => {
                    let cmd = pipe.cmd("HSET").arg(key);
                    for (field, value) in fields {
                        cmd.arg(field).arg(value);
                    }
                }
                StoreOp::HashDel { key, fields } => {
                    pipe.cmd("HDEL").arg(key).arg(fields);
                }
                StoreOp::SetAdd { key, members } => {
                    pipe.cmd("SADD").arg(key).arg(members);
                }
                StoreOp::SetRemove { key, members } => {
                    pipe.cmd("SREM").arg(key).arg(members);
                }
                StoreOp::Delete { key } => {
                    pipe.cmd("DEL").arg(key);
                }
                StoreOp::Publish { channel, payload } => {
                    pipe.cmd("PUBLISH").arg(channel).arg(payload);
                }
            }
            pipe.ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(&str, String)], max_len: usize) -> StoreResult<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("MAXLEN").arg("~").arg(max_len).arg("*");
        for (name, value) in fields {
            cmd.arg(*name).arg(value);
        }
        let mut conn = self.conn.clone();
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    async fn read_after(&self, stream: &str, cursor: &StreamCursor) -> StoreResult<Vec<StreamEntry>> {
        let mut conn = self.blocking_connection().await?;
        let from = match cursor {
            StreamCursor::Latest => "$",
            StreamCursor::After(id) => id.as_str(),
        };
        let reply: Option<StreamReadReply> = match redis::cmd("XREAD")
            .arg("BLOCK")
            .arg(0)
            .arg("STREAMS")
            .arg(stream)
            .arg(from)
            .query_async(&mut conn)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                self.reset_blocking_connection().await;
                return Err(e.into());
            }
        };

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for raw in key.ids {
                entries.push(to_entry(raw)?);
            }
        }
        Ok(entries)
    }

    async fn read_recent(&self, stream: &str, since_millis: u64) -> StoreResult<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(stream)
            .arg("+")
            .arg(since_millis)
            .query_async(&mut conn)
            .await?;
        reply.ids.into_iter().map(to_entry).collect()
    }

    async fn time_millis(&self) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let (secs, micros): (u64, u64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs * 1000 + micros / 1000)
    }

    async fn server_version(&self) -> StoreResult<String> {
        let mut conn = self.conn.clone();
        let info: String = redis::cmd("INFO").arg("server").query_async(&mut conn).await?;
        version_from_info(&info)
            .ok_or_else(|| StoreError::Response("INFO reply carries no redis_version".to_string()))
    }

    async fn subscribe(&self, channels: &[&str]) -> StoreResult<BoxStream<'static, StoreResult<ChannelMessage>>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(*channel).await?;
        }
        debug!("Subscribed to {} channel(s)", channels.len());

        let messages = pubsub.into_on_message().map(|msg| {
            let payload: String = msg.get_payload().map_err(StoreError::from)?;
            Ok(ChannelMessage {
                channel: msg.get_channel_name().to_string(),
                payload,
            })
        });
        Ok(messages.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_from_info() {
        let info = "# Server\r\nredis_version:7.2.4\r\nredis_git_sha1:00000000\r\n";
        assert_eq!(version_from_info(info).as_deref(), Some("7.2.4"));
        assert_eq!(version_from_info("# Server\r\n"), None);
    }

    #[test]
    fn test_redact_url_hides_credentials() {
        assert_eq!(redact_url("redis://:secret@10.0.0.5:6379/0"), "10.0.0.5:6379/0");
        assert_eq!(redact_url("redis://127.0.0.1"), "redis://127.0.0.1");
    }
}
