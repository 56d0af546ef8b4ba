//! Platform-agnostic types for insulin pump bridge synchronization.
//!
//! This crate provides the data model shared by the sync core, the
//! persistent store and the service.
//!
//! # Features
//!
//! - Telemetry snapshots with validity flags and change windows
//! - Bridge and pump identity records
//! - Hex-encoded session link keys
//! - Error types for data parsing
//!
//! # Example
//!
//! ```
//! use pumpsync_types::{BridgeInfo, TelemetrySnapshot};
//! use time::OffsetDateTime;
//!
//! let now = OffsetDateTime::now_utc();
//! let mut snapshot = TelemetrySnapshot::new(now, now);
//! snapshot.device_name = BridgeInfo::new("1234567").device_name();
//! assert!(!snapshot.flags.any_event());
//! ```

pub mod error;
pub mod snapshot;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use snapshot::{BolusKind, ChangeWindow, TelemetrySnapshot, ValidityFlags};
pub use types::{BridgeInfo, ChannelStatus, LinkKey, PumpInfo};
