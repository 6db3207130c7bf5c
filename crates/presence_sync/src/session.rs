//! # Player Session Store
//!
//! Reads and writes the per-player session records, keeps this proxy's
//! online set in step with them, and fans player lifecycle events out to the
//! other proxies over the player channels.
//!
//! Every local change is one [`WriteBatch`]: the session hash fields, the
//! online-set update and the envelope publish travel in a single round trip.
//! Reads for players connected to this proxy are answered by the host and
//! never reach the cache or the store.

use crate::cache::{PlayerAttribute, PresenceCache, ServerMap};
use crate::envelope::Envelope;
use crate::error::PresenceError;
use crate::events::{NetworkEvent, NetworkEvents};
use crate::keys::{fields, KeySpace};
use crate::liveness::ProxyRegistry;
use crate::platform::ProxyPlatform;
use crate::store::{SharedStore, WriteBatch};
use crate::translator::UuidTranslator;
use crate::types::{LastSeen, LocalPlayer, PlayerId, PlayerSession};
use crate::utils::current_timestamp_millis;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a kick ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickOutcome {
    /// The player was connected here and has been disconnected
    DeliveredLocally,
    /// Published for the owning proxy to act on
    Relayed,
}

/// Session CRUD and player event propagation for one proxy.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    proxy_id: String,
    platform: Arc<dyn ProxyPlatform>,
    cache: Arc<PresenceCache>,
    events: NetworkEvents,
    registry: Arc<ProxyRegistry>,
    translator: Arc<UuidTranslator>,
}

impl SessionStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SharedStore>,
        keys: KeySpace,
        proxy_id: impl Into<String>,
        platform: Arc<dyn ProxyPlatform>,
        cache: Arc<PresenceCache>,
        events: NetworkEvents,
        registry: Arc<ProxyRegistry>,
        translator: Arc<UuidTranslator>,
    ) -> Self {
        Self {
            store,
            keys,
            proxy_id: proxy_id.into(),
            platform,
            cache,
            events,
            registry,
            translator,
        }
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    fn online_set(&self) -> String {
        self.keys.online_players(&self.proxy_id)
    }

    fn publish_envelope(batch: WriteBatch, envelope: &Envelope) -> Result<WriteBatch, PresenceError> {
        match envelope.channel() {
            Some(channel) => Ok(batch.publish(channel, envelope.encode()?)),
            None => Ok(batch),
        }
    }

    /// Writes the store side of an offline transition, without publishing.
    fn offline_batch(&self, uuid: &PlayerId) -> WriteBatch {
        let data_key = self.keys.player_data(uuid);
        WriteBatch::new()
            .hset(&data_key, fields::LAST_ONLINE, current_timestamp_millis().to_string())
            .hdel(data_key, fields::TRANSIENT)
    }

    /// Records a player that just connected to this proxy.
    ///
    /// Writes the session fields, persists the name ↔ uuid mapping, adds the
    /// uuid to this proxy's online set and publishes `join`, then raises
    /// [`NetworkEvent::PlayerJoinedNetwork`] locally.
    pub async fn add_session(&self, uuid: PlayerId, name: &str, ip: IpAddr) -> Result<(), PresenceError> {
        let data_key = self.keys.player_data(&uuid);
        let envelope = Envelope::Join {
            proxy: self.proxy_id.clone(),
            uuid,
        };

        let batch = WriteBatch::new()
            .hset_many(
                &data_key,
                vec![
                    (fields::LAST_ONLINE.to_string(), "0".to_string()),
                    (fields::PROXY.to_string(), self.proxy_id.clone()),
                    (fields::IP.to_string(), ip.to_string()),
                ],
            )
            .hdel(&data_key, [fields::SERVER])
            .extend(self.translator.persist_batch(name, uuid)?)
            .sadd(self.online_set(), [uuid.to_string()]);
        let batch = Self::publish_envelope(batch, &envelope)?;
        self.store.apply(batch).await?;

        self.cache.on_join(&uuid);
        self.events.emit(NetworkEvent::PlayerJoinedNetwork {
            uuid,
            proxy: self.proxy_id.clone(),
        });
        debug!("Player {} ({}) joined through {}", name, uuid, self.proxy_id);
        Ok(())
    }

    /// Records a player that disconnected from this proxy.
    pub async fn remove_session(&self, uuid: PlayerId) -> Result<(), PresenceError> {
        let envelope = Envelope::Leave {
            proxy: self.proxy_id.clone(),
            uuid,
        };
        let batch = self
            .offline_batch(&uuid)
            .srem(self.online_set(), [uuid.to_string()]);
        self.store.apply(Self::publish_envelope(batch, &envelope)?).await?;

        self.cache.on_leave(&uuid);
        self.events.emit(NetworkEvent::PlayerLeftNetwork {
            uuid,
            proxy: self.proxy_id.clone(),
        });
        debug!("Player {} left through {}", uuid, self.proxy_id);
        Ok(())
    }

    /// Records a local player moving between backend servers.
    pub async fn change_server(&self, uuid: PlayerId, from: Option<&str>, to: &str) -> Result<(), PresenceError> {
        let envelope = Envelope::ServerChange {
            proxy: self.proxy_id.clone(),
            uuid,
            from: from.map(str::to_string),
            to: to.to_string(),
        };
        let batch = WriteBatch::new().hset_many(
            self.keys.player_data(&uuid),
            vec![
                (fields::SERVER.to_string(), to.to_string()),
                (fields::LAST_SERVER.to_string(), to.to_string()),
            ],
        );
        self.store.apply(Self::publish_envelope(batch, &envelope)?).await?;

        self.cache.on_server_change(&uuid);
        self.events.emit(NetworkEvent::PlayerChangedServer {
            uuid,
            from: from.map(str::to_string),
            to: to.to_string(),
        });
        Ok(())
    }

    /// Disconnects a player wherever it is connected.
    ///
    /// Local delivery is tried first; only if the player is not here is a
    /// `kick` envelope published for the owning proxy.
    pub async fn kick(&self, uuid: PlayerId, message: &str) -> Result<KickOutcome, PresenceError> {
        if self.platform.kick_local(&uuid, message) {
            return Ok(KickOutcome::DeliveredLocally);
        }
        let envelope = Envelope::Kick {
            proxy: self.proxy_id.clone(),
            uuid,
            message: message.to_string(),
        };
        self.store
            .apply(Self::publish_envelope(WriteBatch::new(), &envelope)?)
            .await?;
        Ok(KickOutcome::Relayed)
    }

    /// Writes a locally connected player back into the store.
    ///
    /// Used when the online set lost a player this proxy still holds. No
    /// `join` is published: peers already learned of the player.
    pub async fn register_local(&self, player: &LocalPlayer) -> Result<(), PresenceError> {
        let mut session_fields = vec![
            (fields::LAST_ONLINE.to_string(), "0".to_string()),
            (fields::PROXY.to_string(), self.proxy_id.clone()),
            (fields::IP.to_string(), player.ip.to_string()),
        ];
        if let Some(server) = &player.server {
            session_fields.push((fields::SERVER.to_string(), server.clone()));
            session_fields.push((fields::LAST_SERVER.to_string(), server.clone()));
        }
        let batch = WriteBatch::new()
            .hset_many(self.keys.player_data(&player.uuid), session_fields)
            .sadd(self.online_set(), [player.uuid.to_string()]);
        self.store.apply(batch).await?;
        Ok(())
    }

    /// Removes a uuid from this proxy's online set without touching its
    /// session record; the record belongs to another proxy now.
    pub async fn drop_membership(&self, uuid: &PlayerId) -> Result<(), PresenceError> {
        self.store
            .apply(WriteBatch::new().srem(self.online_set(), [uuid.to_string()]))
            .await?;
        Ok(())
    }

    /// Marks every local player offline and removes it from this proxy's
    /// online set, publishing `leave` for each in the same round trip.
    ///
    /// Peers handling the `death` that follows then find nothing left to
    /// announce.
    pub async fn release_all(&self) -> Result<usize, PresenceError> {
        let players = self.platform.local_players();
        if players.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::new();
        for player in &players {
            let envelope = Envelope::Leave {
                proxy: self.proxy_id.clone(),
                uuid: player.uuid,
            };
            batch = Self::publish_envelope(batch.extend(self.offline_batch(&player.uuid)), &envelope)?;
        }
        let members = players.iter().map(|player| player.uuid.to_string());
        self.store.apply(batch.srem(self.online_set(), members)).await?;
        for player in &players {
            self.cache.on_leave(&player.uuid);
        }
        Ok(players.len())
    }

    /// Deletes this proxy's online set.
    pub async fn clear_own_set(&self) -> Result<(), PresenceError> {
        self.store.apply(WriteBatch::new().del(self.online_set())).await?;
        Ok(())
    }

    /// Raises a network leave for every member of `proxy_id`'s online set.
    ///
    /// # Returns
    ///
    /// The members that were announced.
    pub async fn announce_departure(&self, proxy_id: &str) -> Result<Vec<PlayerId>, PresenceError> {
        let members = self.stored_members(proxy_id).await?;
        for uuid in &members {
            self.cache.on_leave(uuid);
            self.events.emit(NetworkEvent::PlayerLeftNetwork {
                uuid: *uuid,
                proxy: proxy_id.to_string(),
            });
        }
        Ok(members.into_iter().collect())
    }

    /// Deletes a dead proxy's online set and marks the sessions it still
    /// owned offline. Sessions already taken over by another proxy are left
    /// alone.
    pub async fn clear_proxy(&self, proxy_id: &str, members: &[PlayerId]) -> Result<(), PresenceError> {
        let requests: Vec<(String, String)> = members
            .iter()
            .map(|uuid| (self.keys.player_data(uuid), fields::PROXY.to_string()))
            .collect();
        let owners = self.store.hget_many(&requests).await?;

        let mut batch = WriteBatch::new();
        for (uuid, owner) in members.iter().zip(owners) {
            if owner.as_deref() == Some(proxy_id) {
                batch = batch.extend(self.offline_batch(uuid));
            }
        }
        self.store.apply(batch.del(self.keys.online_players(proxy_id))).await?;
        Ok(())
    }

    /// Parsed members of a proxy's online set as recorded in the store.
    pub async fn stored_members(&self, proxy_id: &str) -> Result<HashSet<PlayerId>, PresenceError> {
        let raw = self.store.smembers(&self.keys.online_players(proxy_id)).await?;
        Ok(parse_members(raw, proxy_id))
    }

    // ------------------------------------------------------------------
    // Remote events
    // ------------------------------------------------------------------

    pub fn on_remote_join(&self, uuid: PlayerId, proxy: String) {
        self.cache.on_join(&uuid);
        self.events.emit(NetworkEvent::PlayerJoinedNetwork { uuid, proxy });
    }

    pub fn on_remote_leave(&self, uuid: PlayerId, proxy: String) {
        self.cache.on_leave(&uuid);
        self.events.emit(NetworkEvent::PlayerLeftNetwork { uuid, proxy });
    }

    pub fn on_remote_server_change(&self, uuid: PlayerId, from: Option<String>, to: String) {
        self.cache.on_server_change(&uuid);
        self.events.emit(NetworkEvent::PlayerChangedServer { uuid, from, to });
    }

    pub fn on_remote_kick(&self, uuid: PlayerId, message: &str) {
        if self.platform.kick_local(&uuid, message) {
            info!("👢 Kicked {} on request of another proxy", uuid);
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Backend server the player is on, `None` if offline or connecting.
    pub async fn server_of(&self, uuid: &PlayerId) -> Result<Option<String>, PresenceError> {
        if let Some(player) = self.platform.local_player(uuid) {
            return Ok(player.server);
        }
        Ok(self
            .cache
            .get(PlayerAttribute::Server, self.store.as_ref(), &self.keys, uuid)
            .await?)
    }

    pub async fn last_server_of(&self, uuid: &PlayerId) -> Result<Option<String>, PresenceError> {
        Ok(self
            .cache
            .get(PlayerAttribute::LastServer, self.store.as_ref(), &self.keys, uuid)
            .await?)
    }

    /// Proxy the player is connected to.
    pub async fn proxy_of(&self, uuid: &PlayerId) -> Result<Option<String>, PresenceError> {
        if self.platform.local_player(uuid).is_some() {
            return Ok(Some(self.proxy_id.clone()));
        }
        Ok(self
            .cache
            .get(PlayerAttribute::Proxy, self.store.as_ref(), &self.keys, uuid)
            .await?)
    }

    pub async fn ip_of(&self, uuid: &PlayerId) -> Result<Option<IpAddr>, PresenceError> {
        if let Some(player) = self.platform.local_player(uuid) {
            return Ok(Some(player.ip));
        }
        let raw = self
            .cache
            .get(PlayerAttribute::Ip, self.store.as_ref(), &self.keys, uuid)
            .await?;
        Ok(raw.and_then(|ip| match ip.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!("Session of {} holds an invalid ip '{}'", uuid, ip);
                None
            }
        }))
    }

    /// Reads `last-online` straight from the store; it is never cached.
    pub async fn last_online(&self, uuid: &PlayerId) -> Result<LastSeen, PresenceError> {
        if self.platform.local_player(uuid).is_some() {
            return Ok(LastSeen::Online);
        }
        let raw = self
            .store
            .hget(&self.keys.player_data(uuid), fields::LAST_ONLINE)
            .await?;
        Ok(LastSeen::from_field(raw.as_deref()))
    }

    /// Whether the player is online: listed in its owning proxy's online set
    /// with `last-online` at zero.
    pub async fn is_online(&self, uuid: &PlayerId) -> Result<bool, PresenceError> {
        if self.platform.local_player(uuid).is_some() {
            return Ok(true);
        }
        let data_key = self.keys.player_data(uuid);
        let values = self
            .store
            .hget_many(&[
                (data_key.clone(), fields::PROXY.to_string()),
                (data_key, fields::LAST_ONLINE.to_string()),
            ])
            .await?;
        let (Some(Some(proxy)), Some(last_online)) = (values.first(), values.get(1)) else {
            return Ok(false);
        };
        if LastSeen::from_field(last_online.as_deref()) != LastSeen::Online {
            return Ok(false);
        }
        Ok(self
            .store
            .sismember(&self.keys.online_players(proxy), &uuid.to_string())
            .await?)
    }

    /// Full session record, `None` if the player was never seen.
    pub async fn session(&self, uuid: &PlayerId) -> Result<Option<PlayerSession>, PresenceError> {
        let stored = self.store.hgetall(&self.keys.player_data(uuid)).await?;
        let local = self.platform.local_player(uuid);
        if stored.is_empty() && local.is_none() {
            return Ok(None);
        }

        let mut session = PlayerSession {
            uuid: *uuid,
            owning_proxy_id: stored.get(fields::PROXY).cloned(),
            current_server_id: stored.get(fields::SERVER).cloned(),
            last_server_id: stored.get(fields::LAST_SERVER).cloned(),
            source_ip: stored.get(fields::IP).and_then(|ip| ip.parse().ok()),
            last_seen: LastSeen::from_field(stored.get(fields::LAST_ONLINE).map(String::as_str)),
        };
        if let Some(player) = local {
            session.owning_proxy_id = Some(self.proxy_id.clone());
            session.current_server_id = player.server;
            session.source_ip = Some(player.ip);
            session.last_seen = LastSeen::Online;
        }
        Ok(Some(session))
    }

    /// Backend server to players across every live proxy, cached briefly.
    pub async fn servers_to_players(&self) -> Result<Arc<ServerMap>, PresenceError> {
        let proxies = self.registry.known_proxies();
        Ok(self
            .cache
            .servers_to_players(self.store.as_ref(), &self.keys, &proxies)
            .await?)
    }

    /// Players connected to `proxy_id`.
    ///
    /// Answered by the host for this proxy and from the store for live
    /// peers; any other id is [`PresenceError::UnknownProxy`].
    pub async fn players_on(&self, proxy_id: &str) -> Result<HashSet<PlayerId>, PresenceError> {
        if proxy_id == self.proxy_id {
            return Ok(self.platform.local_players().into_iter().map(|p| p.uuid).collect());
        }
        if !self.registry.is_alive(proxy_id) {
            return Err(PresenceError::UnknownProxy(proxy_id.to_string()));
        }
        self.stored_members(proxy_id).await
    }

    /// Union of the players of every live proxy, read in one round trip.
    pub async fn network_players(&self) -> Result<HashSet<PlayerId>, PresenceError> {
        let peers: Vec<String> = self
            .registry
            .known_proxies()
            .into_iter()
            .filter(|id| *id != self.proxy_id)
            .collect();
        let set_keys: Vec<String> = peers.iter().map(|id| self.keys.online_players(id)).collect();

        let mut players: HashSet<PlayerId> = self.platform.local_players().into_iter().map(|p| p.uuid).collect();
        for (proxy_id, raw) in peers.iter().zip(self.store.smembers_many(&set_keys).await?) {
            players.extend(parse_members(raw, proxy_id));
        }
        Ok(players)
    }
}

fn parse_members(raw: HashSet<String>, proxy_id: &str) -> HashSet<PlayerId> {
    raw.into_iter()
        .filter_map(|member| match member.parse() {
            Ok(uuid) => Some(uuid),
            Err(_) => {
                warn!("Online set of {} holds a malformed uuid '{}'", proxy_id, member);
                None
            }
        })
        .collect()
}
