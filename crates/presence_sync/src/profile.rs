//! External profile lookup, the last resort of the UUID translator.
//!
//! [`ProfileLookup`] is the seam; [`MojangProfileClient`] is the HTTP
//! implementation. Name to uuid lookups are batched at most 100 names per
//! request with a pause between requests to stay under the rate limit.

use crate::error::LookupError;
use crate::types::PlayerId;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Names accepted by one profile request.
pub const PROFILES_PER_REQUEST: usize = 100;

const PROFILES_URL: &str = "https://api.mojang.com/profiles/minecraft";
const NAME_LOOKUP_URL: &str = "https://playerdb.co/api/player/minecraft";

/// A player profile as known to the lookup service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub uuid: PlayerId,
    pub name: String,
}

#[async_trait]
pub trait ProfileLookup: Send + Sync + 'static {
    /// Resolves names to profiles; unknown names are simply absent.
    async fn profiles_for_names(&self, names: &[String]) -> Result<Vec<Profile>, LookupError>;

    /// Resolves the current name of `uuid`, `None` if the service has none.
    async fn name_for_uuid(&self, uuid: &PlayerId) -> Result<Option<String>, LookupError>;
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct PlayerDbResponse {
    #[serde(default)]
    success: bool,
    data: Option<PlayerDbData>,
}

#[derive(Debug, Deserialize)]
struct PlayerDbData {
    player: Option<PlayerDbPlayer>,
}

#[derive(Debug, Deserialize)]
struct PlayerDbPlayer {
    username: String,
}

/// HTTP client for the public Mojang profile API.
#[derive(Debug, Clone)]
pub struct MojangProfileClient {
    http: reqwest::Client,
    profiles_url: String,
    name_lookup_url: String,
    batch_delay: Duration,
}

impl MojangProfileClient {
    pub fn new() -> Self {
        Self::with_endpoints(PROFILES_URL, NAME_LOOKUP_URL)
    }

    /// Creates a client talking to other endpoints, e.g. a caching mirror.
    pub fn with_endpoints(profiles_url: impl Into<String>, name_lookup_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            profiles_url: profiles_url.into(),
            name_lookup_url: name_lookup_url.into(),
            batch_delay: Duration::from_millis(100),
        }
    }

    async fn fetch_batch(&self, names: &[String]) -> Result<Vec<Profile>, LookupError> {
        let raw: Vec<RawProfile> = self
            .http
            .post(&self.profiles_url)
            .json(names)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        raw.into_iter()
            .map(|profile| {
                PlayerId::parse_any(&profile.id)
                    .map(|uuid| Profile {
                        uuid,
                        name: profile.name,
                    })
                    .ok_or_else(|| LookupError::Response(format!("invalid profile id '{}'", profile.id)))
            })
            .collect()
    }
}

impl Default for MojangProfileClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProfileLookup for MojangProfileClient {
    async fn profiles_for_names(&self, names: &[String]) -> Result<Vec<Profile>, LookupError> {
        let mut profiles = Vec::with_capacity(names.len());
        for (index, batch) in names.chunks(PROFILES_PER_REQUEST).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.batch_delay).await;
            }
            debug!("Looking up {} profile(s)", batch.len());
            profiles.extend(self.fetch_batch(batch).await?);
        }
        Ok(profiles)
    }

    async fn name_for_uuid(&self, uuid: &PlayerId) -> Result<Option<String>, LookupError> {
        let url = format!("{}/{}", self.name_lookup_url, uuid);
        let response: PlayerDbResponse = self.http.get(url).send().await?.json().await?;
        if !response.success {
            return Ok(None);
        }
        Ok(response.data.and_then(|d| d.player).map(|p| p.username))
    }
}
