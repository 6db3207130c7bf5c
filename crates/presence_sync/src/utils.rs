//! # Utility Functions
//!
//! Timestamp helpers shared by every component. All liveness arithmetic is
//! done in unix seconds, all session timestamps in unix milliseconds.
//! Background tasks share [`shutdown_requested`] to observe the poison flag.

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Returns the current Unix timestamp in seconds.
///
/// A clock set before the Unix epoch yields `0` rather than panicking; the
/// liveness window then simply treats every peer as stale.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Returns the current Unix timestamp in milliseconds.
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Resolves once the poison flag turns `true` or its sender is dropped.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_agree() {
        let secs = current_timestamp();
        let millis = current_timestamp_millis();
        assert!(millis / 1000 >= secs);
        assert!(millis / 1000 - secs <= 1);
    }
}
