//! Collaborator abstractions used by the sync orchestrator.
//!
//! [`DeviceLink`] abstracts the USB bridge and the radio session with the
//! pump, [`PersistentStore`] the storage engine, and the remaining traits
//! the one-shot wake timer and the downstream consumers of sync events.

use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use pumpsync_types::{BridgeInfo, ChannelStatus, LinkKey, PumpInfo, TelemetrySnapshot};

use crate::error::Result;
use crate::events::StatusKind;
use crate::guard::ChangeSet;
use crate::settings::UploadTarget;

/// Session established with the pump through the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpSession {
    /// Link key in use for this session.
    pub key: LinkKey,
    /// Radio MAC of the paired pump.
    pub pump_mac: u64,
}

/// Trait abstracting the bridge device and its radio link to the pump.
///
/// Protocol-level retries belong to implementations; every method fails
/// with a tagged [`crate::Error`] the orchestrator can classify.
///
/// # Example
///
/// ```ignore
/// use pumpsync_core::{DeviceLink, Result};
///
/// async fn serial<D: DeviceLink>(link: &D) -> Result<String> {
///     link.open().await?;
///     link.request_device_info().await
/// }
/// ```
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Open the USB transport.
    async fn open(&self) -> Result<()>;

    /// Read the bridge serial number.
    async fn request_device_info(&self) -> Result<String>;

    /// Enter passthrough mode and open a session with the pump.
    ///
    /// With `cached_key` the key exchange is skipped; without it a fresh key
    /// is requested from the pump.
    async fn establish_session(&self, cached_key: Option<&LinkKey>) -> Result<PumpSession>;

    /// Find the radio channel the pump answers on, trying `preferred` first.
    async fn negotiate_channel(&self, preferred: u8) -> Result<ChannelStatus>;

    /// Read the pump status. `captured_at` becomes the snapshot's event time.
    async fn read_status(&self, captured_at: OffsetDateTime) -> Result<TelemetrySnapshot>;

    /// Close the session and leave passthrough/control mode.
    async fn close(&self) -> Result<()>;
}

/// Query contract of the persistent store.
///
/// Writes only happen through [`crate::guard::Transaction`], which hands the
/// collected changes to [`PersistentStore::commit`] in one piece.
pub trait PersistentStore: Send + Sync {
    /// Bridge record by serial.
    fn bridge(&self, serial: &str) -> Result<Option<BridgeInfo>>;

    /// Pump record by MAC.
    fn pump(&self, mac: u64) -> Result<Option<PumpInfo>>;

    /// Snapshots of one pump captured after `since`.
    fn history(&self, mac: u64, since: OffsetDateTime) -> Result<Vec<TelemetrySnapshot>>;

    /// Snapshots of every pump captured after `since`.
    fn recent(&self, since: OffsetDateTime) -> Result<Vec<TelemetrySnapshot>>;

    /// Apply every change atomically.
    fn commit(&self, changes: ChangeSet) -> Result<()>;

    /// Delete snapshots captured before `cutoff`, returning how many were removed.
    fn purge_before(&self, cutoff: OffsetDateTime) -> Result<usize>;
}

/// One-shot wake timer. Re-arming replaces the pending wake.
pub trait WakeScheduler: Send + Sync {
    fn arm_at(&self, at: OffsetDateTime);
}

/// Presents status lines to the user. Fire and forget.
pub trait Notifier: Send + Sync {
    fn send_status(&self, kind: StatusKind, text: &str);
}

/// Schedules uploads to downstream services.
///
/// Scheduling a target that already has an upload pending is a no-op.
pub trait UploadDispatcher: Send + Sync {
    fn schedule_upload(&self, target: UploadTarget, after: Duration);
}
