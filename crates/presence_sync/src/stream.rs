//! # Event Log
//!
//! The ordered stream carries control envelopes: heartbeats, deaths, remote
//! commands and relay messages. [`EventLog`] appends to it and
//! [`StreamConsumer`] tails it.
//!
//! ## Self-origin entries
//!
//! Every append is tagged with a random per-process instance id. When the
//! consumer meets an entry published under its own proxy id it stops the
//! batch there: the entries after it are assumed to be this process's own
//! later writes. The cursor stays on the self-authored entry, so whatever
//! followed it is read again on the next pass rather than lost. An own-id
//! entry carrying a foreign instance id means a second process uses this
//! proxy id, which is logged as a warning.

use crate::envelope::{Envelope, EnvelopeHandler};
use crate::error::PresenceError;
use crate::keys::{stream_fields, STREAM_KEY};
use crate::store::{SharedStore, StreamCursor, StreamEntry};
use crate::utils::shutdown_requested;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Publisher side of the event stream.
pub struct EventLog {
    store: Arc<dyn SharedStore>,
    proxy_id: String,
    instance_id: Uuid,
    max_len: usize,
}

impl EventLog {
    pub fn new(store: Arc<dyn SharedStore>, proxy_id: impl Into<String>, max_len: usize) -> Self {
        Self {
            store,
            proxy_id: proxy_id.into(),
            instance_id: Uuid::new_v4(),
            max_len,
        }
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    /// Random id of this process, distinct from the proxy id.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Appends an envelope to the stream.
    ///
    /// # Returns
    ///
    /// The stream id assigned by the store.
    pub async fn publish(&self, envelope: &Envelope) -> Result<String, PresenceError> {
        let fields = [
            (stream_fields::PAYLOAD, envelope.encode()?),
            (stream_fields::KIND, envelope.kind().to_string()),
            (stream_fields::INSTANCE, self.instance_id.to_string()),
        ];
        let id = self.store.append(STREAM_KEY, &fields, self.max_len).await?;
        trace!("Appended {} envelope as {}", envelope.kind(), id);
        Ok(id)
    }

    /// A consumer that recognises this log's own entries.
    pub fn consumer(&self, backoff: Duration) -> StreamConsumer {
        StreamConsumer {
            store: Arc::clone(&self.store),
            proxy_id: self.proxy_id.clone(),
            instance_id: self.instance_id.to_string(),
            cursor: StreamCursor::Latest,
            backoff,
        }
    }
}

/// Tails the event stream and dispatches peer envelopes.
///
/// The cursor lives in memory only; a new consumer starts at the latest entry
/// and never replays history.
pub struct StreamConsumer {
    store: Arc<dyn SharedStore>,
    proxy_id: String,
    instance_id: String,
    cursor: StreamCursor,
    backoff: Duration,
}

impl StreamConsumer {
    pub fn cursor(&self) -> &StreamCursor {
        &self.cursor
    }

    /// Handles one batch of entries in stream order.
    ///
    /// # Returns
    ///
    /// The number of envelopes passed to `handler`.
    pub async fn process_batch(&mut self, entries: Vec<StreamEntry>, handler: &dyn EnvelopeHandler) -> usize {
        let mut dispatched = 0;
        for entry in entries {
            self.cursor = StreamCursor::After(entry.id.clone());

            let Some(payload) = entry.field(stream_fields::PAYLOAD) else {
                warn!("Stream entry {} has no payload, skipping", entry.id);
                continue;
            };
            let envelope = match Envelope::decode(payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Skipping undecodable stream entry {}: {}", entry.id, e);
                    continue;
                }
            };

            if envelope.origin() == self.proxy_id {
                let instance = entry.field(stream_fields::INSTANCE).unwrap_or("unknown");
                if instance != self.instance_id {
                    warn!(
                        "⚠️ Stream entry {} was published as proxy '{}' by another process (instance {}). \
                         Two proxies may be configured with the same id.",
                        entry.id, self.proxy_id, instance
                    );
                }
                break;
            }

            let kind = envelope.kind();
            match handler.handle(envelope).await {
                Ok(()) => dispatched += 1,
                Err(e) => warn!("Failed to handle {} entry {}: {}", kind, entry.id, e),
            }
        }
        dispatched
    }

    /// Blocks for the next batch and handles it.
    pub async fn poll(&mut self, handler: &dyn EnvelopeHandler) -> Result<usize, PresenceError> {
        let entries = self.store.read_after(STREAM_KEY, &self.cursor).await?;
        Ok(self.process_batch(entries, handler).await)
    }

    /// Spawns the consumer loop.
    ///
    /// A failed read is logged, followed by the fixed backoff, and the loop
    /// resumes from the last processed entry. Only the poison flag ends it.
    pub fn start(mut self, handler: Arc<dyn EnvelopeHandler>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("📜 Event stream consumer started for proxy {}", self.proxy_id);
            loop {
                let read = tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => break,
                    read = self.store.read_after(STREAM_KEY, &self.cursor) => read,
                };

                match read {
                    Ok(entries) => {
                        self.process_batch(entries, handler.as_ref()).await;
                    }
                    Err(e) => {
                        error!("❌ Event stream read failed: {}. Retrying in {:?}", e, self.backoff);
                        tokio::select! {
                            _ = shutdown_requested(&mut shutdown) => break,
                            _ = tokio::time::sleep(self.backoff) => {}
                        }
                    }
                }
            }
            debug!("Event stream consumer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::flaky::FlakyStore;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl EnvelopeHandler for Recorder {
        async fn handle(&self, envelope: Envelope) -> Result<(), PresenceError> {
            self.seen.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    fn death(proxy: &str) -> Envelope {
        Envelope::Death {
            proxy: proxy.to_string(),
        }
    }

    #[tokio::test]
    async fn test_self_entry_defers_rest_of_batch() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let own = EventLog::new(Arc::clone(&store), "p1", 100);
        let peer = EventLog::new(Arc::clone(&store), "p2", 100);

        let mut consumer = own.consumer(Duration::from_millis(10));
        consumer.cursor = StreamCursor::After("0-0".to_string());
        peer.publish(&death("p2")).await.unwrap();
        own.publish(&death("p1")).await.unwrap();
        peer.publish(&death("p3")).await.unwrap();

        let recorder = Recorder::default();
        assert_eq!(consumer.poll(&recorder).await.unwrap(), 1);
        assert_eq!(consumer.poll(&recorder).await.unwrap(), 1);

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![death("p2"), death("p3")]);
    }

    #[tokio::test]
    async fn test_undecodable_entries_are_skipped() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let own = EventLog::new(Arc::clone(&store), "p1", 100);
        let mut consumer = own.consumer(Duration::from_millis(10));
        consumer.cursor = StreamCursor::After("0-0".to_string());

        store
            .append(STREAM_KEY, &[(stream_fields::PAYLOAD, "{\"kind\":\"nope\"}".to_string())], 100)
            .await
            .unwrap();
        EventLog::new(Arc::clone(&store), "p2", 100)
            .publish(&death("p2"))
            .await
            .unwrap();

        let recorder = Recorder::default();
        assert_eq!(consumer.poll(&recorder).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_consumer_resumes_from_cursor_after_read_error() {
        let flaky = Arc::new(FlakyStore::new(1, 0));
        let store: Arc<dyn SharedStore> = flaky.clone();
        let own = EventLog::new(Arc::clone(&store), "p1", 100);
        let peer = EventLog::new(Arc::clone(&store), "p2", 100);
        peer.publish(&death("p2")).await.unwrap();
        peer.publish(&death("p3")).await.unwrap();

        let mut consumer = own.consumer(Duration::from_millis(10));
        consumer.cursor = StreamCursor::After("0-0".to_string());
        let recorder = Arc::new(Recorder::default());
        let (stop, shutdown) = watch::channel(false);
        let handle = consumer.start(recorder.clone(), shutdown);

        wait_for_seen(&recorder, 2).await;
        peer.publish(&death("p4")).await.unwrap();
        wait_for_seen(&recorder, 3).await;

        assert_eq!(flaky.read_failures.load(std::sync::atomic::Ordering::SeqCst), 0);
        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![death("p2"), death("p3"), death("p4")]);

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    async fn wait_for_seen(recorder: &Recorder, count: usize) {
        for _ in 0..100 {
            if recorder.seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("consumer dispatched fewer than {} envelopes", count);
    }

    #[tokio::test]
    async fn test_consumer_task_stops_on_poison() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let own = EventLog::new(Arc::clone(&store), "p1", 100);
        let (stop, shutdown) = watch::channel(false);
        let handle = own
            .consumer(Duration::from_millis(10))
            .start(Arc::new(Recorder::default()), shutdown);

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
