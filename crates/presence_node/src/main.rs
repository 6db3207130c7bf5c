//! Main entry point of the presence node.
//!
//! Runs one headless cluster member against a Redis-compatible store: it
//! heartbeats, follows the control stream and player channels, reconciles
//! and leaves the cluster cleanly on SIGINT/SIGTERM.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{bail, Context, Result};
use cli::CliArgs;
use config::AppConfig;
use presence_sync::{MojangProfileClient, PresenceNode, ProfileLookup, RedisStore, RosterPlatform};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A configured node ready to start.
pub struct Application {
    config: AppConfig,
    node: Arc<PresenceNode>,
    purge_only: bool,
}

impl Application {
    /// Loads configuration, applies CLI overrides and connects to the store.
    pub async fn new(args: CliArgs) -> Result<Self> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(proxy_id) = args.proxy_id {
            config.proxy.id = proxy_id;
        }
        if let Some(redis_url) = args.redis_url {
            config.redis.url = redis_url;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        if let Err(e) = config.validate() {
            bail!("Configuration validation failed: {}", e);
        }
        logging::setup_logging(&config.logging, args.json_logs)?;
        config.ensure_proxy_id(&args.config_path).await?;

        let store = Arc::new(
            RedisStore::connect(&config.redis.url)
                .await
                .context("connecting to the store")?,
        );
        let lookup: Option<Arc<dyn ProfileLookup>> = if config.uuid.external_lookup {
            Some(Arc::new(MojangProfileClient::new()))
        } else {
            None
        };
        let node = PresenceNode::new(
            config.to_presence_config(),
            store,
            Arc::new(RosterPlatform::new()),
            lookup,
        )?;

        info!(
            "📂 Config: {} | Proxy: {} | Network: {}",
            args.config_path.display(),
            config.proxy.id,
            config.proxy.network_id
        );

        Ok(Self {
            config,
            node: Arc::new(node),
            purge_only: args.purge_uuid_cache,
        })
    }

    /// Runs until a termination signal arrives, then leaves the cluster.
    pub async fn run(self) -> Result<()> {
        if self.purge_only {
            let removed = self.node.purge_uuid_cache().await?;
            info!("🧹 Purged {} expired uuid-cache entries", removed);
            return Ok(());
        }

        self.node.start().await?;
        let status = self.start_status_reports();

        info!("✅ Proxy {} is now part of the cluster", self.node.proxy_id());
        info!("🛑 Press Ctrl+C to leave the cluster");
        match signals::wait_for_shutdown_signal(self.node.proxy_id()).await {
            Ok(signal) => debug!("Stopping after {}", signal),
            Err(e) => error!("❌ Signal handling failed, leaving the cluster: {}", e),
        }

        if let Some(status) = status {
            status.abort();
        }
        self.node.shutdown().await?;
        info!("👋 Proxy {} left the cluster", self.node.proxy_id());
        Ok(())
    }

    fn start_status_reports(&self) -> Option<JoinHandle<()>> {
        let period = self.config.timing.status_interval_secs;
        if period == 0 {
            return None;
        }
        let node = self.node.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(period));
            interval.tick().await;
            loop {
                interval.tick().await;
                let proxies = node.known_proxies();
                info!(
                    "📊 Cluster: {} live proxies | {} players on the network",
                    proxies.len(),
                    node.total_network_players()
                );
                let lagged = node.lagged_proxies();
                if !lagged.is_empty() {
                    info!("Awaiting purge of lagged proxies: {}", lagged.join(", "));
                }
            }
        }))
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Node error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start node: {:?}", e);
            std::process::exit(1);
        }
    }
}
