//! # Host Platform Interface
//!
//! The proxy runtime that actually holds player connections is an external
//! collaborator. The engine only needs to ask it who is connected locally,
//! deliver kicks and run console commands; [`ProxyPlatform`] is that contract.
//!
//! [`RosterPlatform`] is an in-memory implementation backed by a player
//! roster. The headless node binary runs on it, and the test suite uses it to
//! script joins, moves and disconnects.

use crate::types::{LocalPlayer, PlayerId};
use dashmap::DashMap;
use std::sync::Mutex;
use tracing::info;

/// What the engine needs from the host proxy runtime.
///
/// Implementations are called from several tasks at once and must not block
/// for long; the answers are treated as ground truth for local players.
pub trait ProxyPlatform: Send + Sync + 'static {
    /// Every player connected to this proxy right now.
    fn local_players(&self) -> Vec<LocalPlayer>;

    fn local_player(&self, uuid: &PlayerId) -> Option<LocalPlayer>;

    /// Looks a local player up by name, ignoring case.
    fn local_player_by_name(&self, name: &str) -> Option<LocalPlayer>;

    /// Disconnects a local player.
    ///
    /// # Returns
    ///
    /// `true` if the player was connected here and the kick was delivered.
    fn kick_local(&self, uuid: &PlayerId, message: &str) -> bool;

    /// Runs a command on the proxy console.
    fn execute_command(&self, command: &str);

    fn local_player_count(&self) -> usize {
        self.local_players().len()
    }
}

/// In-memory [`ProxyPlatform`] driven through its roster methods.
#[derive(Debug, Default)]
pub struct RosterPlatform {
    players: DashMap<PlayerId, LocalPlayer>,
    commands: Mutex<Vec<String>>,
    kicks: Mutex<Vec<(PlayerId, String)>>,
}

impl RosterPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, player: LocalPlayer) {
        self.players.insert(player.uuid, player);
    }

    pub fn disconnect(&self, uuid: &PlayerId) -> Option<LocalPlayer> {
        self.players.remove(uuid).map(|(_, player)| player)
    }

    /// Moves a connected player to `server`, returning the previous server.
    pub fn move_to(&self, uuid: &PlayerId, server: impl Into<String>) -> Option<Option<String>> {
        self.players
            .get_mut(uuid)
            .map(|mut player| player.server.replace(server.into()))
    }

    /// Commands executed so far, oldest first.
    pub fn executed_commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Kicks delivered so far, oldest first.
    pub fn delivered_kicks(&self) -> Vec<(PlayerId, String)> {
        self.kicks.lock().map(|k| k.clone()).unwrap_or_default()
    }
}

impl ProxyPlatform for RosterPlatform {
    fn local_players(&self) -> Vec<LocalPlayer> {
        self.players.iter().map(|entry| entry.value().clone()).collect()
    }

    fn local_player(&self, uuid: &PlayerId) -> Option<LocalPlayer> {
        self.players.get(uuid).map(|entry| entry.value().clone())
    }

    fn local_player_by_name(&self, name: &str) -> Option<LocalPlayer> {
        self.players
            .iter()
            .find(|entry| entry.value().name.eq_ignore_ascii_case(name))
            .map(|entry| entry.value().clone())
    }

    fn kick_local(&self, uuid: &PlayerId, message: &str) -> bool {
        let Some((_, player)) = self.players.remove(uuid) else {
            return false;
        };
        info!("👢 Kicked {} ({}): {}", player.name, uuid, message);
        if let Ok(mut kicks) = self.kicks.lock() {
            kicks.push((*uuid, message.to_string()));
        }
        true
    }

    fn execute_command(&self, command: &str) {
        info!("⌨️ Console command: {}", command);
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command.to_string());
        }
    }

    fn local_player_count(&self) -> usize {
        self.players.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn player(name: &str) -> LocalPlayer {
        LocalPlayer {
            uuid: PlayerId::new(),
            name: name.to_string(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server: None,
        }
    }

    #[test]
    fn test_roster_lookup_and_move() {
        let platform = RosterPlatform::new();
        let steve = player("Steve");
        platform.connect(steve.clone());

        assert_eq!(platform.local_player_by_name("steve").map(|p| p.uuid), Some(steve.uuid));
        assert_eq!(platform.move_to(&steve.uuid, "lobby"), Some(None));
        assert_eq!(platform.move_to(&steve.uuid, "survival"), Some(Some("lobby".to_string())));
        assert_eq!(platform.local_player_count(), 1);
    }

    #[test]
    fn test_kick_only_delivers_to_connected_players() {
        let platform = RosterPlatform::new();
        let alex = player("Alex");
        platform.connect(alex.clone());

        assert!(!platform.kick_local(&PlayerId::new(), "bye"));
        assert!(platform.kick_local(&alex.uuid, "bye"));
        assert_eq!(platform.local_player_count(), 0);
        assert_eq!(platform.delivered_kicks(), vec![(alex.uuid, "bye".to_string())]);
    }
}
