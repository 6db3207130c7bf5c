//! Network-level notifications raised for the host runtime.
//!
//! The engine never calls back into the host for these; it publishes them on
//! a [`NetworkEvents`] bus and the host subscribes with
//! [`NetworkEvents::subscribe`].

use crate::types::PlayerId;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A player connected to some proxy of the network
    PlayerJoinedNetwork { uuid: PlayerId, proxy: String },
    /// A player left the network, either cleanly or by purge
    PlayerLeftNetwork { uuid: PlayerId, proxy: String },
    PlayerChangedServer {
        uuid: PlayerId,
        from: Option<String>,
        to: String,
    },
    /// A relay message arrived on a host-level channel
    PubSubMessage { channel: String, message: String },
}

/// Broadcast bus for [`NetworkEvent`]s.
#[derive(Debug, Clone)]
pub struct NetworkEvents {
    sender: broadcast::Sender<NetworkEvent>,
}

impl NetworkEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event; having no subscriber is not an error.
    pub fn emit(&self, event: NetworkEvent) {
        trace!("Network event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for NetworkEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let events = NetworkEvents::default();
        let mut first = events.subscribe();
        let mut second = events.subscribe();

        let uuid = PlayerId::new();
        events.emit(NetworkEvent::PlayerJoinedNetwork {
            uuid,
            proxy: "proxy-1".to_string(),
        });

        for rx in [&mut first, &mut second] {
            assert_eq!(
                rx.recv().await.unwrap(),
                NetworkEvent::PlayerJoinedNetwork {
                    uuid,
                    proxy: "proxy-1".to_string()
                }
            );
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        NetworkEvents::default().emit(NetworkEvent::PubSubMessage {
            channel: "c".to_string(),
            message: "m".to_string(),
        });
    }
}
