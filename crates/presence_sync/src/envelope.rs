//! # Event Envelopes
//!
//! Every message a proxy sends to its peers, whether over the ordered stream
//! or a pub/sub channel, is an [`Envelope`]. The set of kinds is closed and
//! decoded through the `kind` discriminator, so an unknown kind is a decode
//! error the consumer logs and skips.
//!
//! ## Wire form
//!
//! ```json
//! {"kind":"server-change","proxy":"proxy-1","uuid":"069a79f4-44e9-4726-a5be-fca90e38aaf5","from":"lobby","to":"survival"}
//! ```

use crate::error::PresenceError;
use crate::keys;
use crate::types::{HeartbeatData, PlayerId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A typed, origin-tagged message between cluster members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Envelope {
    /// Liveness and load of the origin proxy (stream)
    Heartbeat {
        proxy: String,
        heartbeat: u64,
        players: usize,
    },
    /// The origin proxy is shutting down (stream)
    Death { proxy: String },
    /// Console command for one proxy or for all of them (stream)
    RunCommand {
        proxy: String,
        #[serde(rename = "proxy-to-run")]
        target: String,
        command: String,
    },
    /// Host-level message on an arbitrary named channel (stream)
    RelayMessage {
        proxy: String,
        channel: String,
        message: String,
    },
    Join {
        proxy: String,
        uuid: PlayerId,
    },
    Leave {
        proxy: String,
        uuid: PlayerId,
    },
    ServerChange {
        proxy: String,
        uuid: PlayerId,
        from: Option<String>,
        to: String,
    },
    /// Ask the owning proxy to disconnect a player it holds
    Kick {
        proxy: String,
        uuid: PlayerId,
        message: String,
    },
}

impl Envelope {
    pub fn heartbeat(proxy: impl Into<String>, data: HeartbeatData) -> Self {
        Envelope::Heartbeat {
            proxy: proxy.into(),
            heartbeat: data.heartbeat,
            players: data.players,
        }
    }

    /// The discriminator as written on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Heartbeat { .. } => "heartbeat",
            Envelope::Death { .. } => "death",
            Envelope::RunCommand { .. } => "run-command",
            Envelope::RelayMessage { .. } => "relay-message",
            Envelope::Join { .. } => "join",
            Envelope::Leave { .. } => "leave",
            Envelope::ServerChange { .. } => "server-change",
            Envelope::Kick { .. } => "kick",
        }
    }

    /// Id of the proxy that produced this envelope.
    pub fn origin(&self) -> &str {
        match self {
            Envelope::Heartbeat { proxy, .. }
            | Envelope::Death { proxy }
            | Envelope::RunCommand { proxy, .. }
            | Envelope::RelayMessage { proxy, .. }
            | Envelope::Join { proxy, .. }
            | Envelope::Leave { proxy, .. }
            | Envelope::ServerChange { proxy, .. }
            | Envelope::Kick { proxy, .. } => proxy,
        }
    }

    /// Pub/sub channel for player events, `None` for stream envelopes.
    pub fn channel(&self) -> Option<&'static str> {
        match self {
            Envelope::Join { .. } => Some(keys::CHANNEL_PLAYER_JOIN),
            Envelope::Leave { .. } => Some(keys::CHANNEL_PLAYER_LEAVE),
            Envelope::ServerChange { .. } => Some(keys::CHANNEL_SERVER_CHANGE),
            Envelope::Kick { .. } => Some(keys::CHANNEL_KICK),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Receiver of envelopes from other proxies.
///
/// The stream consumer and the pub/sub listener both filter out envelopes
/// this proxy produced before calling [`handle`](Self::handle).
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<(), PresenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_change_wire_shape() {
        let uuid: PlayerId = "069a79f4-44e9-4726-a5be-fca90e38aaf5".parse().unwrap();
        let envelope = Envelope::ServerChange {
            proxy: "proxy-1".to_string(),
            uuid,
            from: None,
            to: "lobby".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["kind"], "server-change");
        assert_eq!(value["proxy"], "proxy-1");
        assert_eq!(value["uuid"], "069a79f4-44e9-4726-a5be-fca90e38aaf5");
        assert!(value["from"].is_null());
        assert_eq!(value["to"], "lobby");
        assert_eq!(envelope.channel(), Some(keys::CHANNEL_SERVER_CHANGE));
    }

    #[test]
    fn test_run_command_target_field_name() {
        let raw = r#"{"kind":"run-command","proxy":"p2","proxy-to-run":"allservers","command":"alert hi"}"#;
        let envelope = Envelope::decode(raw).unwrap();
        assert_eq!(envelope.origin(), "p2");
        assert!(matches!(envelope, Envelope::RunCommand { ref target, .. } if target == "allservers"));
        assert_eq!(envelope.channel(), None);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(Envelope::decode(r#"{"kind":"teleport","proxy":"p1"}"#).is_err());
        assert!(Envelope::decode("not json").is_err());
    }
}
