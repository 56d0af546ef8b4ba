//! Synchronization core for insulin pump bridges.
//!
//! This crate polls an insulin pump through a USB radio bridge, classifies
//! what changed since the last poll and decides when to poll next.
//!
//! # Features
//!
//! - **Adaptive scheduling**: poll times aligned to the CGM transmission cycle
//! - **Event validation**: new SGV, finger BG, bolus, temp basal and consumable changes
//! - **Health counters**: threshold-gated warnings with suggested actions
//! - **Atomic cycles**: every write of a poll commits together or not at all
//! - **Event channel**: status lines and upload requests for independent consumers
//!
//! # Cycle
//!
//! | State | Action |
//! |-------|--------|
//! | Check due | Defer while the pump talks to the sensor |
//! | Acquire device | Open the bridge, read its serial |
//! | Establish session | Offer the cached link key or request a new one |
//! | Negotiate channel | Find the pump's radio channel, check RSSI |
//! | Read status / validate | Read the pump status, mark new events |
//! | Commit | Write bridge, pump and snapshot in one transaction |
//! | Schedule next | Re-arm the wake timer, request uploads, raise warnings |
//!
//! # Quick Start
//!
//! ```
//! use pumpsync_core::mock::{MemoryStore, MockDeviceLink, RecordingWakeScheduler};
//! use pumpsync_core::{SyncContext, SyncOrchestrator, SyncSettings};
//! use time::OffsetDateTime;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut orchestrator = SyncOrchestrator::new(
//!         MockDeviceLink::new("1234567", 0x0023_F745_12AB_CDEF),
//!         MemoryStore::new(),
//!         RecordingWakeScheduler::default(),
//!         SyncContext::new(SyncSettings::default()),
//!     );
//!
//!     let outcome = orchestrator.run_cycle(OffsetDateTime::now_utc()).await;
//!     println!("Next poll at {}", outcome.next_wake);
//! }
//! ```

pub mod error;
pub mod events;
pub mod guard;
pub mod history;
pub mod metrics;
pub mod mock;
pub mod scheduler;
pub mod settings;
pub mod sync;
pub mod thresholds;
pub mod traits;
pub mod validation;

// Core exports
pub use error::{Error, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender, StatusKind, SyncEvent, forward_events};
pub use guard::{ChangeSet, Transaction};
pub use history::PumpHistory;
pub use metrics::{Counter, CounterSnapshot, HealthCounters};
pub use scheduler::PollScheduler;
pub use settings::{SyncContext, SyncSettings, UploadRequest, UploadTarget};
pub use sync::{CycleOutcome, CycleState, SyncOrchestrator};
pub use thresholds::{HealthWarning, WarningThresholds};
pub use traits::{
    DeviceLink, Notifier, PersistentStore, PumpSession, UploadDispatcher, WakeScheduler,
};
pub use validation::{TelemetryValidator, ValidatorConfig};

// Re-export from pumpsync-types
pub use pumpsync_types::{
    BolusKind, BridgeInfo, ChangeWindow, ChannelStatus, LinkKey, PumpInfo, TelemetrySnapshot,
    ValidityFlags,
};
