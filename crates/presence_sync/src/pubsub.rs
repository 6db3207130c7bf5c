//! Listener for the player event channels.
//!
//! Join, leave, server-change and kick envelopes are fanned out over pub/sub
//! for low latency. The listener holds one subscription to all four channels,
//! ignores envelopes this proxy published, and resubscribes after a fixed
//! backoff whenever the subscription fails or ends.

use crate::envelope::{Envelope, EnvelopeHandler};
use crate::keys::PLAYER_CHANNELS;
use crate::store::{ChannelMessage, SharedStore};
use crate::utils::shutdown_requested;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

pub struct PlayerEventListener {
    store: Arc<dyn SharedStore>,
    proxy_id: String,
    backoff: Duration,
}

impl PlayerEventListener {
    pub fn new(store: Arc<dyn SharedStore>, proxy_id: impl Into<String>, backoff: Duration) -> Self {
        Self {
            store,
            proxy_id: proxy_id.into(),
            backoff,
        }
    }

    /// Decodes and dispatches one channel message.
    ///
    /// # Returns
    ///
    /// `true` if the envelope reached `handler`.
    pub async fn dispatch(&self, message: ChannelMessage, handler: &dyn EnvelopeHandler) -> bool {
        let envelope = match Envelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Ignoring undecodable message on {}: {}", message.channel, e);
                return false;
            }
        };
        if envelope.channel() != Some(message.channel.as_str()) {
            warn!(
                "Ignoring {} envelope received on unexpected channel {}",
                envelope.kind(),
                message.channel
            );
            return false;
        }
        if envelope.origin() == self.proxy_id {
            trace!("Ignoring own {} envelope", envelope.kind());
            return false;
        }

        let kind = envelope.kind();
        if let Err(e) = handler.handle(envelope).await {
            warn!("Failed to handle {} message: {}", kind, e);
            return false;
        }
        true
    }

    /// Spawns the subscription loop; only the poison flag ends it.
    pub fn start(self, handler: Arc<dyn EnvelopeHandler>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            'subscribe: loop {
                let subscription = tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => break 'subscribe,
                    subscription = self.store.subscribe(&PLAYER_CHANNELS) => subscription,
                };

                match subscription {
                    Ok(mut messages) => {
                        info!("📡 Listening on {} player channels", PLAYER_CHANNELS.len());
                        loop {
                            let next = tokio::select! {
                                _ = shutdown_requested(&mut shutdown) => break 'subscribe,
                                next = messages.next() => next,
                            };
                            match next {
                                Some(Ok(message)) => {
                                    self.dispatch(message, handler.as_ref()).await;
                                }
                                Some(Err(e)) => {
                                    error!("❌ Player channel subscription failed: {}", e);
                                    break;
                                }
                                None => {
                                    warn!("Player channel subscription closed");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => error!("❌ Could not subscribe to player channels: {}", e),
                }

                debug!("Resubscribing in {:?}", self.backoff);
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => break 'subscribe,
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }
            debug!("Player channel listener stopped");
        })
    }
}
