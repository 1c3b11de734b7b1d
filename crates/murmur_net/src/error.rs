//! Network error types.

use std::time::Duration;

/// Errors that can occur in the murmur_net crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Invalid configuration, detected before the node starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A transport-level error (mailbox connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Beacon socket setup or I/O failed.
    #[error("Beacon error: {0}")]
    Beacon(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The node is not running (never started, or already stopped).
    #[error("Node not running")]
    NotRunning,

    /// The operation is only allowed before the node starts.
    #[error("Node already running")]
    AlreadyRunning,

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
