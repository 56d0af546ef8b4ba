//! Error types for pumpsync-store.

use std::path::PathBuf;

use time::OffsetDateTime;

/// Result type for pumpsync-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in pumpsync-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The pump already has a snapshot at this event time.
    #[error("Pump {pump_mac:#x} already has a snapshot at {event_time}")]
    DuplicateSnapshot {
        pump_mac: u64,
        event_time: OffsetDateTime,
    },

    /// Invalid timestamp.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A stored link key is not valid hex.
    #[error("Invalid link key: {0}")]
    InvalidKey(#[from] pumpsync_types::ParseError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<Error> for pumpsync_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::DuplicateSnapshot { event_time, .. } => {
                pumpsync_core::Error::DuplicateEventTime(event_time)
            }
            other => pumpsync_core::Error::store(other),
        }
    }
}
