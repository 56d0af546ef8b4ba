//! Error types for pumpsync-core.
//!
//! This module defines every failure a sync cycle can run into, from the
//! USB transport up to the persistent store.
//!
//! # Error Handling Strategies
//!
//! The orchestrator matches on the error kind to pick the counter it bumps
//! and the delay before the next wake.
//!
//! | Error Type | Counter | Next wake |
//! |------------|---------|-----------|
//! | [`Error::TransportUnavailable`] | none | standard interval |
//! | [`Error::PermissionDenied`] | none | standard interval, permission event |
//! | [`Error::Io`], [`Error::Checksum`], [`Error::Encryption`], [`Error::Hashing`] | `commsError` | standard interval |
//! | [`Error::UnexpectedMessage`] | `commsError` | 60 seconds |
//! | [`Error::Timeout`] | `commsError` | 90 seconds |
//! | [`Error::NoChannel`] | `commsConnectError` | standard (halved when reducing) |
//! | [`Error::WeakSignal`] | `commsConnectError`, `commsSignalError` | standard (halved when reducing) |
//! | [`Error::Store`] | none | standard interval |
//!
//! Every error produces exactly one status line, and the wake scheduler is
//! re-armed on every exit path.

use std::time::Duration as StdDuration;

use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// Errors that can occur while synchronizing with the pump.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The USB bridge is not plugged in or could not be opened.
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The host denied access to the USB bridge.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// I/O error on the transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A message failed its checksum.
    #[error("Checksum error: {0}")]
    Checksum(String),

    /// A message could not be decrypted.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: StdDuration,
    },

    /// The pump answered with a message that does not fit the exchange.
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Session hashing failed.
    #[error("Hashing error: {0}")]
    Hashing(String),

    /// The pump did not answer on any radio channel.
    #[error("Could not communicate with the pump, no radio channel found")]
    NoChannel,

    /// The pump answered but the signal is too weak to continue.
    #[error("Signal too weak to continue ({rssi_percent}%)")]
    WeakSignal {
        /// Received signal strength as a percentage.
        rssi_percent: u8,
    },

    /// The persistent store failed.
    #[error("Store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A snapshot with the same event time is already in the history.
    #[error("History already holds a snapshot at {0}")]
    DuplicateEventTime(OffsetDateTime),

    /// Persisted or replayed data could not be decoded.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: StdDuration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Wrap a store backend error.
    pub fn store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Store(Box::new(err))
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether this is a recoverable communication failure that bumps the
    /// `commsError` counter.
    pub fn counts_as_comms_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Checksum(_)
                | Self::Encryption(_)
                | Self::Timeout { .. }
                | Self::UnexpectedMessage(_)
                | Self::Hashing(_)
        )
    }

    /// Whether the pump could not be reached over the radio.
    pub fn is_link_error(&self) -> bool {
        matches!(self, Self::NoChannel | Self::WeakSignal { .. })
    }

    /// Delay before the next attempt after this error.
    pub fn retry_interval(&self, standard: Duration) -> Duration {
        match self {
            Self::UnexpectedMessage(_) => Duration::seconds(60),
            Self::Timeout { .. } => Duration::seconds(90),
            _ => standard,
        }
    }
}

impl From<pumpsync_types::ParseError> for Error {
    fn from(err: pumpsync_types::ParseError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

/// Result type alias using pumpsync-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
