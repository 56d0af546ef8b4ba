//! Background sync service for insulin pump bridges.
//!
//! This crate wires the sync orchestrator to its runtime collaborators:
//! - A tokio wake timer that fires each scheduled poll
//! - The SQLite store for bridges, pumps and snapshots
//! - A replay device link serving recorded bridge sessions
//! - Log-backed status notifier and upload dispatcher
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/pumpsync/service.toml`:
//!
//! ```toml
//! [sync]
//! poll_interval_ms = 300000
//! low_battery_poll_interval_ms = 900000
//! reduce_poll_on_pump_away = false
//!
//! [storage]
//! path = "~/.local/share/pumpsync/data.db"
//!
//! [device]
//! replay = "/var/lib/pumpsync/session.jsonl"
//!
//! [upload]
//! nightscout = true
//! nightscout_delay_ms = 1000
//! xdrip = false
//! xdrip_delay_ms = 500
//! ```

pub mod collector;
pub mod config;
pub mod notify;
pub mod replay;
pub mod wake;

pub use collector::Collector;
pub use config::{
    Config, ConfigError, DeviceConfig, StorageConfig, SyncConfig, UploadConfig, ValidationError,
};
pub use notify::{LogNotifier, LogUploadDispatcher};
pub use replay::{ReplayDeviceLink, ReplayFailure, ReplayFrame, ReplayStatus};
pub use wake::TokioWakeScheduler;
