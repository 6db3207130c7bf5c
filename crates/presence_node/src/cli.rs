//! Command-line interface handling for the presence node.
//!
//! This module provides command-line argument parsing using the `clap` crate.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
///
/// Every option except the config path overrides the matching setting of the
/// configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the proxy id
    pub proxy_id: Option<String>,
    /// Optional override for the redis url
    pub redis_url: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Purge expired uuid-cache entries and exit
    pub purge_uuid_cache: bool,
}

fn command() -> Command {
    Command::new("Presence Node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Cluster member that keeps player presence in sync across proxies")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("presence.toml"),
        )
        .arg(
            Arg::new("proxy-id")
                .short('i')
                .long("proxy-id")
                .value_name("ID")
                .help("Proxy id, unique in the cluster"),
        )
        .arg(
            Arg::new("redis-url")
                .short('r')
                .long("redis-url")
                .value_name("URL")
                .help("Redis url (e.g., redis://127.0.0.1:6379/)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("purge-uuid-cache")
                .long("purge-uuid-cache")
                .help("Delete expired uuid-cache entries and exit")
                .action(ArgAction::SetTrue),
        )
}

impl CliArgs {
    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    /// Parses an explicit argument list.
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_matches(&command().try_get_matches_from(args)?))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("presence.toml")),
            proxy_id: matches.get_one::<String>("proxy-id").cloned(),
            redis_url: matches.get_one::<String>("redis-url").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            purge_uuid_cache: matches.get_flag("purge-uuid-cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CliArgs::try_parse_from(["presence_node"]).unwrap();
        assert_eq!(args.config_path, PathBuf::from("presence.toml"));
        assert_eq!(args.proxy_id, None);
        assert!(!args.json_logs);
        assert!(!args.purge_uuid_cache);
    }

    #[test]
    fn test_overrides() {
        let args = CliArgs::try_parse_from([
            "presence_node",
            "-c",
            "/etc/presence/eu.toml",
            "--proxy-id",
            "eu-1",
            "--redis-url",
            "redis://10.0.0.5:6379/",
            "-l",
            "debug",
            "--json-logs",
        ])
        .unwrap();

        assert_eq!(args.config_path, PathBuf::from("/etc/presence/eu.toml"));
        assert_eq!(args.proxy_id.as_deref(), Some("eu-1"));
        assert_eq!(args.redis_url.as_deref(), Some("redis://10.0.0.5:6379/"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        assert!(CliArgs::try_parse_from(["presence_node", "--bind", "0.0.0.0"]).is_err());
    }
}
