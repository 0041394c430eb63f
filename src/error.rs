//! Error types for the forwarder.

use std::path::PathBuf;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors for rules and last-seen ids.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt store file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Platform channel errors (inbound polling and outbound sends).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Destination {destination} rejected the request: {reason}")]
    Rejected { destination: i64, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("No enabled rule for source {0}")]
    NoRule(i64),

    #[error("Dispatch queue is closed")]
    QueueClosed,

    #[error("History fetch failed for source {source_id}: {reason}")]
    HistoryFetch { source_id: i64, reason: String },
}
