//! Termination signals that make a node leave the cluster.

use tokio::signal;
use tracing::info;

/// Blocks until the process is asked to stop and names the signal that did it.
///
/// Unix nodes stop on SIGINT or SIGTERM, Windows nodes on Ctrl+C.
pub async fn wait_for_shutdown_signal(proxy_id: &str) -> std::io::Result<&'static str> {
    #[cfg(unix)]
    let received = {
        use signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        }
    };

    #[cfg(windows)]
    let received = {
        signal::ctrl_c().await?;
        "Ctrl+C"
    };

    info!("📡 {} received, proxy {} is leaving the cluster", received, proxy_id);
    Ok(received)
}
