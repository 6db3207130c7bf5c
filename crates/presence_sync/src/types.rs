//! # Core Type Definitions
//!
//! The fundamental types shared across the presence engine: player and proxy
//! identities, liveness records and the per-player session record as it is
//! stored in the shared store.
//!
//! ## Key Types
//!
//! - [`PlayerId`] - Unique identifier for a player across the whole network
//! - [`HeartbeatData`] - Liveness and load reported by one proxy
//! - [`PlayerSession`] - One player's presence record
//! - [`LastSeen`] - Tri-state reading of the `last-online` field

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Unique identifier for a player on the network.
///
/// Wraps a UUID so player ids cannot be confused with the per-process
/// instance ids used on the event stream. Serializes as the hyphenated
/// lowercase string, which is also the form used in every store key.
///
/// # Examples
///
/// ```rust
/// use presence_sync::PlayerId;
///
/// let player_id: PlayerId = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
/// assert_eq!(player_id.to_string(), "550e8400-e29b-41d4-a716-446655440000");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Creates a new random player ID using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses either the hyphenated form or the 32 character undashed form
    /// used by the profile lookup service.
    pub fn parse_any(s: &str) -> Option<Self> {
        Uuid::try_parse(s).ok().map(Self)
    }
}

impl std::str::FromStr for PlayerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl From<Uuid> for PlayerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Liveness and load reported by a proxy on every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatData {
    /// Unix seconds at which the heartbeat was produced
    pub heartbeat: u64,
    /// Number of players connected to the proxy at that moment
    pub players: usize,
}

/// A cluster member as tracked in memory by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyNode {
    pub proxy_id: String,
    pub last_heartbeat_epoch_seconds: u64,
    pub online_player_count: usize,
}

/// Reading of a player's `last-online` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastSeen {
    /// The field holds `0`: the player is connected somewhere
    Online,
    /// Unix milliseconds of the last disconnect
    Offline(u64),
    /// No record exists for this player
    Never,
}

impl LastSeen {
    /// Decodes the raw hash field value.
    pub fn from_field(raw: Option<&str>) -> Self {
        match raw.and_then(|s| s.parse::<u64>().ok()) {
            Some(0) => LastSeen::Online,
            Some(millis) => LastSeen::Offline(millis),
            None => LastSeen::Never,
        }
    }

    /// Millisecond value using the wire convention: `0` online, `-1` never seen.
    pub fn as_millis(&self) -> i64 {
        match self {
            LastSeen::Online => 0,
            LastSeen::Offline(millis) => *millis as i64,
            LastSeen::Never => -1,
        }
    }
}

/// One player's presence record as held in the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSession {
    pub uuid: PlayerId,
    /// Proxy that accepted the connection; absent once disconnected
    pub owning_proxy_id: Option<String>,
    /// Backend server; absent while connecting and after disconnect
    pub current_server_id: Option<String>,
    /// Sticky backend server, survives disconnects
    pub last_server_id: Option<String>,
    pub source_ip: Option<IpAddr>,
    pub last_seen: LastSeen,
}

/// A player connected to this proxy, as reported by the host runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPlayer {
    pub uuid: PlayerId,
    pub name: String,
    pub ip: IpAddr,
    /// Backend server the player is on, `None` while still connecting
    pub server: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_id_display_is_hyphenated() {
        let id: PlayerId = "069a79f444e94726a5befca90e38aaf5".parse().unwrap();
        assert_eq!(id.to_string(), "069a79f4-44e9-4726-a5be-fca90e38aaf5");
    }

    #[test]
    fn test_parse_any_accepts_both_forms() {
        let dashed = PlayerId::parse_any("069a79f4-44e9-4726-a5be-fca90e38aaf5");
        let undashed = PlayerId::parse_any("069a79f444e94726a5befca90e38aaf5");
        assert!(dashed.is_some());
        assert_eq!(dashed, undashed);
        assert!(PlayerId::parse_any("Steve").is_none());
    }

    #[test]
    fn test_last_seen_from_field() {
        assert_eq!(LastSeen::from_field(Some("0")), LastSeen::Online);
        assert_eq!(LastSeen::from_field(Some("1700000000000")), LastSeen::Offline(1_700_000_000_000));
        assert_eq!(LastSeen::from_field(None), LastSeen::Never);
        assert_eq!(LastSeen::from_field(Some("garbage")), LastSeen::Never);
        assert_eq!(LastSeen::Never.as_millis(), -1);
    }
}
