//! # Engine Configuration
//!
//! [`PresenceConfig`] carries every tunable of the presence engine. It is a
//! plain value built once by the host (usually from the node's TOML file) and
//! handed to [`crate::PresenceNode::new`]; no component reads configuration
//! from anywhere else.

use crate::error::PresenceError;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for one cluster member.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Stable id of this proxy, unique in the cluster
    pub proxy_id: String,
    /// Network id used as the session key prefix
    pub network_id: String,
    /// How often this proxy publishes its heartbeat
    pub heartbeat_interval: Duration,
    /// Age after which a peer without a fresh heartbeat counts as dead
    pub liveness_window: Duration,
    /// How often the reconciliation pass runs
    pub reconcile_interval: Duration,
    /// TTL of the per-player attribute caches
    pub attribute_cache_ttl: Duration,
    /// TTL of the server to players aggregate
    pub aggregate_cache_ttl: Duration,
    /// Lifetime of name/uuid cache entries
    pub uuid_cache_ttl: Duration,
    /// Fixed delay before a failed listener reconnects
    pub retry_backoff: Duration,
    /// Maximum length the event stream is trimmed to
    pub stream_max_len: usize,
    /// Whether players are authenticated against the profile service
    pub online_mode: bool,
    /// Operator-provided file that lets a restart skip the impostor check
    pub crash_marker: Option<PathBuf>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            proxy_id: String::new(),
            network_id: "main".to_string(),
            heartbeat_interval: Duration::from_secs(1),
            liveness_window: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(60),
            attribute_cache_ttl: Duration::from_secs(60 * 60),
            aggregate_cache_ttl: Duration::from_secs(10 * 60),
            uuid_cache_ttl: Duration::from_secs(3 * 24 * 60 * 60),
            retry_backoff: Duration::from_secs(5),
            stream_max_len: 10_000,
            online_mode: true,
            crash_marker: Some(PathBuf::from("restarted_from_crash.txt")),
        }
    }
}

impl PresenceConfig {
    /// Creates a configuration with defaults for everything but the ids.
    pub fn new(proxy_id: impl Into<String>, network_id: impl Into<String>) -> Self {
        Self {
            proxy_id: proxy_id.into(),
            network_id: network_id.into(),
            ..Self::default()
        }
    }

    /// Validates the configuration for consistency.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is usable, or [`PresenceError::Config`]
    /// describing the first problem found.
    pub fn validate(&self) -> Result<(), PresenceError> {
        if self.proxy_id.trim().is_empty() {
            return Err(PresenceError::Config("proxy id cannot be empty".to_string()));
        }
        if self.proxy_id.contains(char::is_whitespace) {
            return Err(PresenceError::Config(format!(
                "proxy id '{}' must not contain whitespace",
                self.proxy_id
            )));
        }
        if self.proxy_id == crate::keys::ALL_PROXIES {
            return Err(PresenceError::Config(format!(
                "proxy id '{}' is reserved",
                self.proxy_id
            )));
        }
        if self.network_id.trim().is_empty() {
            return Err(PresenceError::Config("network id cannot be empty".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(PresenceError::Config(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.liveness_window <= self.heartbeat_interval {
            return Err(PresenceError::Config(format!(
                "liveness window ({:?}) must exceed the heartbeat interval ({:?})",
                self.liveness_window, self.heartbeat_interval
            )));
        }
        if self.reconcile_interval.is_zero() {
            return Err(PresenceError::Config(
                "reconciliation interval must be greater than zero".to_string(),
            ));
        }
        if self.stream_max_len == 0 {
            return Err(PresenceError::Config("stream cap must be greater than zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let config = PresenceConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.liveness_window, Duration::from_secs(10));
        assert_eq!(config.attribute_cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.aggregate_cache_ttl, Duration::from_secs(600));
        assert_eq!(config.uuid_cache_ttl.as_secs(), 259_200);
        assert_eq!(config.stream_max_len, 10_000);
    }

    #[test]
    fn test_validate() {
        assert!(PresenceConfig::new("proxy-1", "main").validate().is_ok());
        assert!(PresenceConfig::default().validate().is_err());
        assert!(PresenceConfig::new("allservers", "main").validate().is_err());
        assert!(PresenceConfig::new("proxy 1", "main").validate().is_err());

        let mut config = PresenceConfig::new("proxy-1", "main");
        config.liveness_window = Duration::from_millis(500);
        assert!(matches!(config.validate(), Err(PresenceError::Config(_))));
    }
}
