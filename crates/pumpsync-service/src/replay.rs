//! Device link replaying a recorded bridge session.
//!
//! The recording is a JSON-lines file with one [`ReplayFrame`] per poll.
//! Blank lines and lines starting with `#` are skipped. Every
//! [`DeviceLink::open`] advances to the next frame; once the recording is
//! exhausted the bridge reports itself as unplugged.
//!
//! ```text
//! # serial, pump MAC and radio state, then the status read in that poll
//! {"serial":"1234567","pump_mac":10015418596814319,"channel":20,"rssi_percent":62,"status":{"cgm_active":true,"sgv":118,"cgm_age_secs":35,"reservoir_amount":142.5,"pump_battery_pct":75}}
//! {"serial":"1234567","pump_mac":10015418596814319,"failure":"timeout"}
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use pumpsync_core::{
    ChannelStatus, DeviceLink, Error, LinkKey, PumpSession, Result, TelemetrySnapshot,
};

/// Failure injected into a replayed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayFailure {
    /// The bridge is unplugged; `open` fails.
    Unplugged,
    Io,
    Checksum,
    Encryption,
    Timeout,
    UnexpectedMessage,
    Hashing,
}

impl ReplayFailure {
    fn to_error(self) -> Error {
        match self {
            ReplayFailure::Unplugged => Error::TransportUnavailable("bridge unplugged".to_string()),
            ReplayFailure::Io => Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "bridge stopped responding",
            )),
            ReplayFailure::Checksum => Error::Checksum("recorded checksum mismatch".to_string()),
            ReplayFailure::Encryption => Error::Encryption("recorded decrypt failure".to_string()),
            ReplayFailure::Timeout => Error::timeout("read_status", StdDuration::from_secs(10)),
            ReplayFailure::UnexpectedMessage => {
                Error::UnexpectedMessage("recorded out-of-sequence response".to_string())
            }
            ReplayFailure::Hashing => Error::Hashing("recorded hash mismatch".to_string()),
        }
    }
}

/// Pump status fields of a replayed poll. Times are relative to the poll.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReplayStatus {
    pub cgm_active: bool,
    pub cgm_warm_up: bool,
    pub sgv: u16,
    /// Age of the CGM reading in seconds.
    pub cgm_age_secs: Option<i64>,
    pub calibration_due_minutes: u16,
    pub recent_finger_bgl: u16,
    pub last_bolus_amount: f32,
    /// Age of the last bolus in minutes.
    pub last_bolus_age_minutes: Option<i64>,
    pub last_bolus_reference: u8,
    pub bolusing_reference: u8,
    pub bolusing_minutes_remaining: u16,
    pub temp_basal_rate: f32,
    pub temp_basal_percentage: u8,
    pub temp_basal_minutes_remaining: u16,
    pub transmitter_battery_pct: u8,
    pub reservoir_amount: f32,
    pub pump_battery_pct: u8,
}

impl ReplayStatus {
    /// Build the snapshot read at `captured_at` from a pump clock at `device_time`.
    pub fn to_snapshot(&self, captured_at: OffsetDateTime, device_time: OffsetDateTime) -> TelemetrySnapshot {
        let mut snapshot = TelemetrySnapshot::new(captured_at, device_time);
        snapshot.cgm_active = self.cgm_active;
        snapshot.cgm_warm_up = self.cgm_warm_up;
        snapshot.sgv = self.sgv;
        snapshot.cgm_device_time = self
            .cgm_age_secs
            .map(|age| device_time - Duration::seconds(age));
        snapshot.calibration_due_minutes = self.calibration_due_minutes;
        snapshot.recent_finger_bgl = self.recent_finger_bgl;
        snapshot.last_bolus_amount = self.last_bolus_amount;
        snapshot.last_bolus_time = self
            .last_bolus_age_minutes
            .map(|age| device_time - Duration::minutes(age));
        snapshot.last_bolus_reference = self.last_bolus_reference;
        snapshot.bolusing_reference = self.bolusing_reference;
        snapshot.bolusing_minutes_remaining = self.bolusing_minutes_remaining;
        snapshot.temp_basal_rate = self.temp_basal_rate;
        snapshot.temp_basal_percentage = self.temp_basal_percentage;
        snapshot.temp_basal_minutes_remaining = self.temp_basal_minutes_remaining;
        snapshot.transmitter_battery_pct = self.transmitter_battery_pct;
        snapshot.reservoir_amount = self.reservoir_amount;
        snapshot.pump_battery_pct = self.pump_battery_pct;
        snapshot
    }
}

fn default_channel() -> u8 {
    0x14
}

fn default_rssi() -> u8 {
    60
}

/// One recorded poll.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplayFrame {
    pub serial: String,
    pub pump_mac: u64,
    /// Radio channel the pump answered on (0 = no answer).
    #[serde(default = "default_channel")]
    pub channel: u8,
    #[serde(default = "default_rssi")]
    pub rssi_percent: u8,
    /// Hex link key handed out when no cached key is offered.
    #[serde(default)]
    pub link_key: Option<String>,
    /// Pump clock minus wall clock, in seconds.
    #[serde(default)]
    pub clock_offset_secs: i64,
    #[serde(default)]
    pub status: ReplayStatus,
    #[serde(default)]
    pub failure: Option<ReplayFailure>,
}

/// Parse a recording. Line numbers in errors are 1-based.
pub fn parse_frames(content: &str) -> Result<Vec<ReplayFrame>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| Error::InvalidData(format!("replay line {}: {}", i + 1, e)))
        })
        .collect()
}

#[derive(Debug, Default)]
struct ReplayState {
    frames: Option<Vec<ReplayFrame>>,
    next: usize,
    current: Option<ReplayFrame>,
}

/// [`DeviceLink`] serving polls from a recording.
#[derive(Debug)]
pub struct ReplayDeviceLink {
    path: PathBuf,
    state: Mutex<ReplayState>,
}

impl ReplayDeviceLink {
    /// Replay the recording at `path`. The file is read on the first `open`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(ReplayState::default()),
        }
    }

    /// Replay frames already in memory.
    pub fn from_frames(frames: Vec<ReplayFrame>) -> Self {
        Self {
            path: PathBuf::new(),
            state: Mutex::new(ReplayState {
                frames: Some(frames),
                ..Default::default()
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames not yet replayed, `None` before the recording is loaded.
    pub fn remaining(&self) -> Option<usize> {
        let state = self.state();
        state
            .frames
            .as_ref()
            .map(|frames| frames.len().saturating_sub(state.next))
    }

    fn state(&self) -> MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Result<ReplayFrame> {
        self.state()
            .current
            .clone()
            .ok_or_else(|| Error::TransportUnavailable("bridge not open".to_string()))
    }

    async fn load(&self) -> Result<Vec<ReplayFrame>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::TransportUnavailable(format!(
                    "no bridge recording at {}",
                    self.path.display()
                )),
                _ => Error::Io(e),
            })?;
        let frames = parse_frames(&content)?;
        info!(
            frames = frames.len(),
            "Loaded bridge recording from {}",
            self.path.display()
        );
        Ok(frames)
    }
}

#[async_trait]
impl DeviceLink for ReplayDeviceLink {
    async fn open(&self) -> Result<()> {
        if self.state().frames.is_none() {
            let frames = self.load().await?;
            self.state().frames = Some(frames);
        }

        let mut state = self.state();
        let frame = state
            .frames
            .as_ref()
            .and_then(|frames| frames.get(state.next))
            .cloned()
            .ok_or_else(|| Error::TransportUnavailable("bridge recording finished".to_string()))?;
        state.next += 1;

        if frame.failure == Some(ReplayFailure::Unplugged) {
            return Err(ReplayFailure::Unplugged.to_error());
        }
        debug!(frame = state.next, "Replaying bridge poll");
        state.current = Some(frame);
        Ok(())
    }

    async fn request_device_info(&self) -> Result<String> {
        Ok(self.current()?.serial)
    }

    async fn establish_session(&self, cached_key: Option<&LinkKey>) -> Result<PumpSession> {
        let frame = self.current()?;
        let key = match (cached_key, &frame.link_key) {
            (Some(key), _) => key.clone(),
            (None, Some(hex)) => LinkKey::from_hex(hex)
                .map_err(|e| Error::InvalidData(format!("replay link key: {}", e)))?,
            (None, None) => LinkKey::new(frame.serial.clone().into_bytes()),
        };
        Ok(PumpSession {
            key,
            pump_mac: frame.pump_mac,
        })
    }

    async fn negotiate_channel(&self, _preferred: u8) -> Result<ChannelStatus> {
        let frame = self.current()?;
        Ok(ChannelStatus {
            channel: frame.channel,
            rssi_percent: if frame.channel == 0 { 0 } else { frame.rssi_percent },
        })
    }

    async fn read_status(&self, captured_at: OffsetDateTime) -> Result<TelemetrySnapshot> {
        let frame = self.current()?;
        if let Some(failure) = frame.failure {
            return Err(failure.to_error());
        }
        let device_time = captured_at + Duration::seconds(frame.clock_offset_secs);
        Ok(frame.status.to_snapshot(captured_at, device_time))
    }

    async fn close(&self) -> Result<()> {
        self.state().current = None;
        Ok(())
    }
}
