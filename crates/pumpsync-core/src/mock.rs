//! Mock collaborators for testing.
//!
//! This module provides in-memory stand-ins for every collaborator of the
//! sync orchestrator so cycles can be exercised without a USB bridge, a
//! pump or a database.
//!
//! # Features
//!
//! - **Failure injection**: make any [`DeviceLink`] step fail with a chosen error kind
//! - **Call recording**: inspect which link steps ran and which keys were offered
//! - **In-memory store**: [`MemoryStore`] honors the atomic commit contract

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

use pumpsync_types::{BridgeInfo, ChannelStatus, LinkKey, PumpInfo, TelemetrySnapshot};

use crate::error::{Error, Result};
use crate::events::StatusKind;
use crate::guard::ChangeSet;
use crate::settings::UploadTarget;
use crate::traits::{
    DeviceLink, Notifier, PersistentStore, PumpSession, UploadDispatcher, WakeScheduler,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Steps of a device link session, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkStep {
    Open,
    DeviceInfo,
    Session,
    Channel,
    ReadStatus,
    Close,
}

/// Error kinds a [`MockDeviceLink`] can be told to fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    TransportUnavailable,
    PermissionDenied,
    Io,
    Checksum,
    Encryption,
    Timeout,
    UnexpectedMessage,
    Hashing,
}

impl MockFailure {
    fn to_error(self) -> Error {
        match self {
            MockFailure::TransportUnavailable => {
                Error::TransportUnavailable("no bridge attached".to_string())
            }
            MockFailure::PermissionDenied => {
                Error::PermissionDenied("usb access not granted".to_string())
            }
            MockFailure::Io => Error::Io(std::io::Error::other("mock transfer failed")),
            MockFailure::Checksum => Error::Checksum("mock checksum mismatch".to_string()),
            MockFailure::Encryption => Error::Encryption("mock decrypt failed".to_string()),
            MockFailure::Timeout => Error::timeout("mock read", StdDuration::from_secs(10)),
            MockFailure::UnexpectedMessage => {
                Error::UnexpectedMessage("mock unexpected response".to_string())
            }
            MockFailure::Hashing => Error::Hashing("mock hmac unavailable".to_string()),
        }
    }
}

/// A mock bridge and pump for testing.
///
/// # Example
///
/// ```
/// use pumpsync_core::mock::MockDeviceLink;
/// use pumpsync_core::traits::DeviceLink;
///
/// #[tokio::main]
/// async fn main() {
///     let link = MockDeviceLink::new("1234567", 0x0023_F745_12AB_CDEF);
///     link.open().await.unwrap();
///     assert_eq!(link.request_device_info().await.unwrap(), "1234567");
/// }
/// ```
pub struct MockDeviceLink {
    serial: String,
    pump_mac: u64,
    session_key: LinkKey,
    channel: AtomicU8,
    rssi_percent: AtomicU8,
    /// Pump clock offset applied to `device_time`.
    clock_offset: RwLock<Duration>,
    /// Time `negotiate_channel` takes to answer.
    channel_latency: RwLock<Duration>,
    status: RwLock<TelemetrySnapshot>,
    failures: Mutex<HashMap<LinkStep, MockFailure>>,
    calls: Mutex<Vec<LinkStep>>,
    offered_keys: Mutex<Vec<Option<LinkKey>>>,
    open: AtomicBool,
}

impl std::fmt::Debug for MockDeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDeviceLink")
            .field("serial", &self.serial)
            .field("pump_mac", &self.pump_mac)
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockDeviceLink {
    /// Create a link to a pump answering on channel 0x14 with good signal.
    pub fn new(serial: &str, pump_mac: u64) -> Self {
        let epoch = OffsetDateTime::UNIX_EPOCH;
        let mut status = TelemetrySnapshot::new(epoch, epoch);
        status.reservoir_amount = 150.0;
        status.pump_battery_pct = 75;

        Self {
            serial: serial.to_string(),
            pump_mac,
            session_key: LinkKey::new(vec![0x5A; 16]),
            channel: AtomicU8::new(0x14),
            rssi_percent: AtomicU8::new(60),
            clock_offset: RwLock::new(Duration::ZERO),
            channel_latency: RwLock::new(Duration::ZERO),
            status: RwLock::new(status),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            offered_keys: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
        }
    }

    /// Set the channel and signal strength reported by `negotiate_channel`.
    pub fn set_channel(&self, channel: u8, rssi_percent: u8) {
        self.channel.store(channel, Ordering::Relaxed);
        self.rssi_percent.store(rssi_percent, Ordering::Relaxed);
    }

    /// Set the pump clock offset (`device_time - event_time`).
    pub fn set_clock_offset(&self, offset: Duration) {
        *self.clock_offset.write().unwrap_or_else(PoisonError::into_inner) = offset;
    }

    /// Make `negotiate_channel` take `latency` on the tokio clock before
    /// answering, like a slow radio scan.
    pub fn set_channel_latency(&self, latency: Duration) {
        *self.channel_latency.write().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Set the status fields returned by `read_status`.
    ///
    /// Event and device times are replaced on every read.
    pub fn set_status(&self, status: TelemetrySnapshot) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Modify the status fields returned by `read_status`.
    pub fn update_status(&self, f: impl FnOnce(&mut TelemetrySnapshot)) {
        f(&mut self.status.write().unwrap_or_else(PoisonError::into_inner));
    }

    /// Make `step` fail with `failure` until cleared.
    pub fn fail_on(&self, step: LinkStep, failure: MockFailure) {
        lock(&self.failures).insert(step, failure);
    }

    /// Clear all injected failures.
    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Steps called so far.
    pub fn calls(&self) -> Vec<LinkStep> {
        lock(&self.calls).clone()
    }

    /// Keys offered to `establish_session`, in call order.
    pub fn offered_keys(&self) -> Vec<Option<LinkKey>> {
        lock(&self.offered_keys).clone()
    }

    /// Key handed out when no cached key is offered.
    pub fn session_key(&self) -> &LinkKey {
        &self.session_key
    }

    /// Whether the transport is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    fn step(&self, step: LinkStep) -> Result<()> {
        lock(&self.calls).push(step);
        match lock(&self.failures).get(&step) {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DeviceLink for MockDeviceLink {
    async fn open(&self) -> Result<()> {
        self.step(LinkStep::Open)?;
        self.open.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn request_device_info(&self) -> Result<String> {
        self.step(LinkStep::DeviceInfo)?;
        Ok(self.serial.clone())
    }

    async fn establish_session(&self, cached_key: Option<&LinkKey>) -> Result<PumpSession> {
        lock(&self.offered_keys).push(cached_key.cloned());
        self.step(LinkStep::Session)?;
        Ok(PumpSession {
            key: cached_key.cloned().unwrap_or_else(|| self.session_key.clone()),
            pump_mac: self.pump_mac,
        })
    }

    async fn negotiate_channel(&self, _preferred: u8) -> Result<ChannelStatus> {
        let latency = *self.channel_latency.read().unwrap_or_else(PoisonError::into_inner);
        if let Ok(latency) = StdDuration::try_from(latency)
            && !latency.is_zero()
        {
            tokio::time::sleep(latency).await;
        }
        self.step(LinkStep::Channel)?;
        let channel = self.channel.load(Ordering::Relaxed);
        Ok(ChannelStatus {
            channel,
            rssi_percent: if channel == 0 {
                0
            } else {
                self.rssi_percent.load(Ordering::Relaxed)
            },
        })
    }

    async fn read_status(&self, captured_at: OffsetDateTime) -> Result<TelemetrySnapshot> {
        self.step(LinkStep::ReadStatus)?;
        let offset = *self.clock_offset.read().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot = self
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        snapshot.event_time = captured_at;
        snapshot.device_time = captured_at + offset;
        Ok(snapshot)
    }

    async fn close(&self) -> Result<()> {
        self.step(LinkStep::Close)?;
        self.open.store(false, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoreData {
    bridges: HashMap<String, BridgeInfo>,
    pumps: HashMap<u64, PumpInfo>,
    snapshots: Vec<(u64, TelemetrySnapshot)>,
}

/// In-memory [`PersistentStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<StoreData>,
    fail_commits: AtomicBool,
    fail_reads: AtomicBool,
    commits: AtomicU32,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every commit fail.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::Relaxed);
    }

    /// Make every query fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> u32 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Every stored snapshot of every pump.
    pub fn snapshot_count(&self) -> usize {
        self.read().snapshots.len()
    }

    /// Seed a snapshot outside of a transaction.
    pub fn insert_snapshot(&self, pump_mac: u64, snapshot: TelemetrySnapshot) {
        self.write().snapshots.push((pump_mac, snapshot));
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(Error::store(std::io::Error::other("injected read failure")));
        }
        Ok(())
    }
}

impl PersistentStore for MemoryStore {
    fn bridge(&self, serial: &str) -> Result<Option<BridgeInfo>> {
        self.check_reads()?;
        Ok(self.read().bridges.get(serial).cloned())
    }

    fn pump(&self, mac: u64) -> Result<Option<PumpInfo>> {
        self.check_reads()?;
        Ok(self.read().pumps.get(&mac).cloned())
    }

    fn history(&self, mac: u64, since: OffsetDateTime) -> Result<Vec<TelemetrySnapshot>> {
        self.check_reads()?;
        Ok(self
            .read()
            .snapshots
            .iter()
            .filter(|(m, s)| *m == mac && s.event_time > since)
            .map(|(_, s)| s.clone())
            .collect())
    }

    fn recent(&self, since: OffsetDateTime) -> Result<Vec<TelemetrySnapshot>> {
        self.check_reads()?;
        Ok(self
            .read()
            .snapshots
            .iter()
            .filter(|(_, s)| s.event_time > since)
            .map(|(_, s)| s.clone())
            .collect())
    }

    fn commit(&self, changes: ChangeSet) -> Result<()> {
        if self.fail_commits.load(Ordering::Relaxed) {
            return Err(Error::store(std::io::Error::other("injected commit failure")));
        }

        let mut data = self.write();
        for (mac, snapshot) in &changes.snapshots {
            let duplicate = data
                .snapshots
                .iter()
                .any(|(m, s)| m == mac && s.event_time == snapshot.event_time);
            if duplicate {
                return Err(Error::DuplicateEventTime(snapshot.event_time));
            }
        }

        if let Some(bridge) = changes.bridge {
            data.bridges.insert(bridge.serial.clone(), bridge);
        }
        if let Some(pump) = changes.pump {
            data.pumps.insert(pump.mac, pump);
        }
        data.snapshots.extend(changes.snapshots);
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn purge_before(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let mut data = self.write();
        let before = data.snapshots.len();
        data.snapshots.retain(|(_, s)| s.event_time >= cutoff);
        Ok(before - data.snapshots.len())
    }
}

/// [`WakeScheduler`] that records every armed instant.
#[derive(Debug, Default)]
pub struct RecordingWakeScheduler {
    armed: Mutex<Vec<OffsetDateTime>>,
}

impl RecordingWakeScheduler {
    /// Every instant armed so far.
    pub fn armed(&self) -> Vec<OffsetDateTime> {
        lock(&self.armed).clone()
    }

    /// The pending wake, if any.
    pub fn pending(&self) -> Option<OffsetDateTime> {
        lock(&self.armed).last().copied()
    }
}

impl WakeScheduler for RecordingWakeScheduler {
    fn arm_at(&self, at: OffsetDateTime) {
        lock(&self.armed).push(at);
    }
}

/// [`Notifier`] that records every status line.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    lines: Mutex<Vec<(StatusKind, String)>>,
}

impl RecordingNotifier {
    pub fn lines(&self) -> Vec<(StatusKind, String)> {
        lock(&self.lines).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send_status(&self, kind: StatusKind, text: &str) {
        lock(&self.lines).push((kind, text.to_string()));
    }
}

/// [`UploadDispatcher`] that records every request.
#[derive(Debug, Default)]
pub struct RecordingUploadDispatcher {
    requests: Mutex<Vec<(UploadTarget, StdDuration)>>,
}

impl RecordingUploadDispatcher {
    pub fn requests(&self) -> Vec<(UploadTarget, StdDuration)> {
        lock(&self.requests).clone()
    }
}

impl UploadDispatcher for RecordingUploadDispatcher {
    fn schedule_upload(&self, target: UploadTarget, after: StdDuration) {
        lock(&self.requests).push((target, after));
    }
}
