//! Error types for the presence engine.
//!
//! Two layers are kept apart: [`StoreError`] describes what went wrong while
//! talking to the shared store, [`PresenceError`] is what every public
//! operation of the engine returns. "Not found" is never an error here; it is
//! expressed as `None` by the operation itself.

use thiserror::Error;

/// Failures raised by a [`crate::store::SharedStore`] implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or the connection dropped mid-call
    #[error("Store connection error: {0}")]
    Connection(String),
    /// The store answered with something other than what the command expects
    #[error("Store response error: {0}")]
    Response(String),
    /// A stored value could not be decoded into the expected shape
    #[error("Store decode error: {0}")]
    Decode(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Response(err.to_string())
        }
    }
}

/// Errors surfaced by the presence engine.
#[derive(Error, Debug)]
pub enum PresenceError {
    /// Underlying shared store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// An envelope could not be encoded or decoded
    #[error("Envelope error: {0}")]
    Envelope(#[from] serde_json::Error),
    /// Another live process already presents itself under this proxy id
    #[error("Possible impostor instance: proxy id '{0}' heartbeated within the liveness window")]
    ImpostorDetected(String),
    /// The store does not support the commands this engine depends on
    #[error("Unsupported store version {0}, at least 6.2 is required")]
    UnsupportedStoreVersion(String),
    /// The requested proxy is not a known cluster member
    #[error("Unknown proxy id: {0}")]
    UnknownProxy(String),
    /// Configuration is invalid or incomplete
    #[error("Configuration error: {0}")]
    Config(String),
    /// The node is not in a state that allows the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Failures from the external profile lookup service.
#[derive(Error, Debug)]
pub enum LookupError {
    /// HTTP transport failure
    #[error("Lookup transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The service returned a body that does not match the profile schema
    #[error("Lookup response error: {0}")]
    Response(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
