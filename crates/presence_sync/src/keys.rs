//! Store key and channel layout.
//!
//! These names are the wire contract between cluster members and must be
//! identical on every proxy. Only the networked layout is produced; the flat
//! `player:{uuid}` / `proxy:{id}:usersOnline` generation is not readable by
//! this engine.

use crate::types::PlayerId;

/// Ordered event log carrying heartbeat, death, run-command and relay envelopes.
pub const STREAM_KEY: &str = "redisbungee-stream";

/// Hash holding name ↔ uuid cache entries under both keys.
pub const UUID_CACHE_KEY: &str = "uuid-cache";

pub const CHANNEL_PLAYER_JOIN: &str = "redisbungee-player-join";
pub const CHANNEL_PLAYER_LEAVE: &str = "redisbungee-player-leave";
pub const CHANNEL_SERVER_CHANGE: &str = "redisbungee-serverchange";
pub const CHANNEL_KICK: &str = "redisbungee-kick";

/// Every pub/sub channel a node listens on.
pub const PLAYER_CHANNELS: [&str; 4] = [
    CHANNEL_PLAYER_JOIN,
    CHANNEL_PLAYER_LEAVE,
    CHANNEL_SERVER_CHANGE,
    CHANNEL_KICK,
];

/// Run-command target that addresses every proxy.
pub const ALL_PROXIES: &str = "allservers";

/// Session hash field names.
pub mod fields {
    pub const SERVER: &str = "server";
    pub const LAST_SERVER: &str = "last-server";
    pub const PROXY: &str = "proxy";
    pub const IP: &str = "ip";
    pub const LAST_ONLINE: &str = "last-online";

    /// Fields removed when a player disconnects.
    pub const TRANSIENT: [&str; 3] = [SERVER, PROXY, IP];
}

/// Stream entry field names.
pub mod stream_fields {
    pub const PAYLOAD: &str = "payload";
    pub const KIND: &str = "kind";
    pub const INSTANCE: &str = "data-manager-uuid";
}

/// Key builder bound to one network id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    network_id: String,
}

impl KeySpace {
    pub fn new(network_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
        }
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Set of uuids connected to `proxy_id`.
    pub fn online_players(&self, proxy_id: &str) -> String {
        format!("redisbungee::proxies::{proxy_id}::online-players")
    }

    /// Session hash of one player.
    pub fn player_data(&self, uuid: &PlayerId) -> String {
        format!("redis-bungee::{}::player::{}::data", self.network_id, uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::new("main");
        let uuid: PlayerId = "069a79f4-44e9-4726-a5be-fca90e38aaf5".parse().unwrap();
        assert_eq!(
            keys.player_data(&uuid),
            "redis-bungee::main::player::069a79f4-44e9-4726-a5be-fca90e38aaf5::data"
        );
        assert_eq!(
            keys.online_players("proxy-1"),
            "redisbungee::proxies::proxy-1::online-players"
        );
    }
}
