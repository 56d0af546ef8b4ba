//! Poll cycle orchestration.
//!
//! [`SyncOrchestrator`] runs one synchronization cycle per wake: it checks
//! whether the pump is about to talk to the sensor, opens the bridge,
//! establishes a session, negotiates a radio channel, reads and validates the
//! pump status, commits everything in one transaction and re-arms the wake
//! scheduler. Status lines and upload requests leave through the
//! [`EventDispatcher`].
//!
//! # Example
//!
//! ```
//! use pumpsync_core::mock::{MemoryStore, MockDeviceLink, RecordingWakeScheduler};
//! use pumpsync_core::settings::SyncContext;
//! use pumpsync_core::sync::SyncOrchestrator;
//! use time::OffsetDateTime;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut orchestrator = SyncOrchestrator::new(
//!         MockDeviceLink::new("1234567", 0x0023_F745_12AB_CDEF),
//!         MemoryStore::new(),
//!         RecordingWakeScheduler::default(),
//!         SyncContext::default(),
//!     );
//!
//!     let now = OffsetDateTime::now_utc();
//!     let outcome = orchestrator.run_cycle(now).await;
//!     assert!(outcome.error.is_none());
//!     assert!(outcome.next_wake > now);
//! }
//! ```

use time::macros::format_description;
use time::{Duration, OffsetDateTime};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use pumpsync_types::{BolusKind, BridgeInfo, PumpInfo, TelemetrySnapshot};

use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver, StatusKind, SyncEvent};
use crate::guard::Transaction;
use crate::history::{PumpHistory, RETENTION};
use crate::metrics::{Counter, HealthCounters};
use crate::scheduler::{POLL_PERIOD, PollScheduler};
use crate::settings::SyncContext;
use crate::thresholds::HealthWarning;
use crate::traits::{DeviceLink, PersistentStore, WakeScheduler};
use crate::validation::TelemetryValidator;

/// How far back the newest snapshot is looked up for battery state.
const RECENT_WINDOW: Duration = Duration::hours(6);

/// Pump battery at or below this level (and above 0) selects the low
/// battery poll interval.
const LOW_BATTERY_PCT: u8 = 25;

/// RSSI below this is too weak to continue.
const MIN_RSSI_PCT: u8 = 5;

/// RSSI below this counts towards the weak signal warning.
const WEAK_RSSI_PCT: u8 = 20;

/// Pump clock offsets beyond this count towards the clock warning.
const MAX_CLOCK_OFFSET: Duration = Duration::minutes(10);

/// States of a poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    CheckDue,
    AcquireDevice,
    EstablishSession,
    NegotiateChannel,
    ReadStatus,
    Validate,
    Commit,
    ScheduleNext,
    NotifyDownstream,
    Done,
}

/// Result of one cycle.
#[derive(Debug)]
pub struct CycleOutcome {
    /// Instant the wake scheduler was armed for.
    pub next_wake: OffsetDateTime,
    /// The pump was busy with the sensor and was not polled.
    pub busy: bool,
    /// Interval the next poll was requested with.
    pub interval: Duration,
    /// Validated snapshot, when the cycle committed one.
    pub snapshot: Option<TelemetrySnapshot>,
    /// Error that ended the cycle early.
    pub error: Option<Error>,
    /// State the cycle was in when it failed.
    pub failed_at: Option<CycleState>,
    /// Health warnings raised at the end of the cycle.
    pub warnings: Vec<HealthWarning>,
}

impl CycleOutcome {
    /// Whether a snapshot was committed.
    pub fn is_success(&self) -> bool {
        self.snapshot.is_some()
    }
}

/// Per-cycle bookkeeping shared between the poll steps and the error handler.
#[derive(Debug)]
struct CycleProgress {
    state: CycleState,
    interval: Duration,
    link_opened: bool,
    clock_offset: Option<Duration>,
    cycle_start: OffsetDateTime,
    started: Instant,
}

impl CycleProgress {
    fn new(interval: Duration, cycle_start: OffsetDateTime) -> Self {
        Self {
            state: CycleState::CheckDue,
            interval,
            link_opened: false,
            clock_offset: None,
            cycle_start,
            started: Instant::now(),
        }
    }

    /// Current wall-clock time, advanced from the cycle start by the
    /// monotonic time spent in the cycle.
    fn clock(&self) -> OffsetDateTime {
        self.cycle_start + self.started.elapsed()
    }
}

/// Drives poll cycles against a bridge, a store and a wake timer.
pub struct SyncOrchestrator<L, S, W> {
    link: L,
    store: S,
    wake: W,
    context: SyncContext,
    events: EventDispatcher,
    scheduler: PollScheduler,
    validator: TelemetryValidator,
    /// Last pump clock offset seen by this process.
    last_clock_offset: Duration,
}

impl<L, S, W> std::fmt::Debug for SyncOrchestrator<L, S, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("settings", &self.context.settings)
            .field("last_clock_offset", &self.last_clock_offset)
            .finish_non_exhaustive()
    }
}

impl<L, S, W> SyncOrchestrator<L, S, W>
where
    L: DeviceLink,
    S: PersistentStore,
    W: WakeScheduler,
{
    /// Create an orchestrator with its own event channel.
    pub fn new(link: L, store: S, wake: W, context: SyncContext) -> Self {
        Self {
            link,
            store,
            wake,
            context,
            events: EventDispatcher::default(),
            scheduler: PollScheduler::new(),
            validator: TelemetryValidator::default(),
            last_clock_offset: Duration::ZERO,
        }
    }

    /// Publish on an existing event channel.
    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }


    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn wake(&self) -> &W {
        &self.wake
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Subscribe to the events of future cycles.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    fn counters(&self) -> &HealthCounters {
        &self.context.counters
    }

    fn status(&self, kind: StatusKind, text: impl Into<String>) {
        self.events.status(kind, text);
    }

    /// Run one cycle starting at `now`. The wake scheduler is re-armed on
    /// every path, always for an instant after the cycle ends.
    pub async fn run_cycle(&mut self, now: OffsetDateTime) -> CycleOutcome {
        let mut progress = CycleProgress::new(self.context.settings.poll_interval, now);

        let (mut recent, result) = match self.load_recent(now) {
            Ok(recent) => {
                if let Some(due) = self.scheduler.is_due(now, &recent) {
                    return self.defer(now, due);
                }
                progress.interval = self.battery_interval(&recent);
                let result = self.poll(now, &mut progress).await;
                (recent, result)
            }
            Err(err) => (PumpHistory::new(), Err(err)),
        };

        let (snapshot, error, failed_at) = match result {
            Ok(snapshot) => (Some(snapshot), None, None),
            Err(err) => {
                self.report_error(&err, &mut progress);
                (None, Some(err), Some(progress.state))
            }
        };

        if let Some(offset) = progress.clock_offset {
            self.last_clock_offset = offset;
        }

        if progress.link_opened
            && let Err(err) = self.link.close().await
        {
            warn!(error = %err, "Could not close bridge connection");
        }

        match self.store.purge_before(now - RETENTION) {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Purged outdated snapshots"),
            Err(err) => warn!(error = %err, "Could not purge outdated snapshots"),
        }

        if let Some(snapshot) = &snapshot
            && let Err(err) = recent.insert(snapshot.clone())
        {
            debug!(error = %err, "Snapshot already indexed");
        }

        progress.state = CycleState::ScheduleNext;
        let miss_count = self.counters().get(Counter::PumpCgmNa);
        let next_wake = self.scheduler.next_poll_time(
            now,
            progress.interval,
            progress.clock(),
            &recent,
            miss_count,
        );
        self.wake.arm_at(next_wake);
        self.status(
            StatusKind::Info,
            format!("Next poll due at: {}", clock_time(next_wake)),
        );
        info!(
            next_wake = %next_wake,
            interval_secs = progress.interval.whole_seconds(),
            success = snapshot.is_some(),
            "Poll cycle finished"
        );

        progress.state = CycleState::NotifyDownstream;
        for upload in &self.context.settings.uploads {
            let delay_ms = u64::try_from(upload.delay.whole_milliseconds()).unwrap_or(0);
            self.events.send(SyncEvent::UploadRequested {
                target: upload.target,
                delay_ms,
            });
        }
        let warnings = self.raise_warnings();

        CycleOutcome {
            next_wake,
            busy: false,
            interval: progress.interval,
            snapshot,
            error,
            failed_at,
            warnings,
        }
    }

    fn load_recent(&self, now: OffsetDateTime) -> Result<PumpHistory> {
        let snapshots = self.store.recent(now - RECENT_WINDOW)?;
        Ok(index_snapshots(snapshots))
    }

    /// The pump is about to exchange data with the sensor; come back at `due`.
    fn defer(&self, now: OffsetDateTime, due: OffsetDateTime) -> CycleOutcome {
        let wait = (due - now).whole_seconds();
        self.status(
            StatusKind::Info,
            format!(
                "Please wait: Pump is expecting sensor communication. Poll due in {} seconds",
                wait
            ),
        );
        self.wake.arm_at(due);
        info!(due = %due, "Pump busy with sensor, poll deferred");

        CycleOutcome {
            next_wake: due,
            busy: true,
            interval: due - now,
            snapshot: None,
            error: None,
            failed_at: None,
            warnings: Vec::new(),
        }
    }

    fn battery_interval(&self, recent: &PumpHistory) -> Duration {
        let settings = &self.context.settings;
        let battery = recent.latest().map_or(0, |s| s.pump_battery_pct);
        if battery == 0 || battery > LOW_BATTERY_PCT {
            return settings.poll_interval;
        }

        self.status(StatusKind::Warning, "Warning: pump battery low");
        if settings.low_battery_poll_interval != settings.poll_interval {
            self.status(
                StatusKind::Setting,
                format!(
                    "Low battery poll interval: {} minutes",
                    settings.low_battery_poll_interval.whole_minutes()
                ),
            );
        }
        settings.low_battery_poll_interval
    }

    async fn poll(
        &self,
        now: OffsetDateTime,
        progress: &mut CycleProgress,
    ) -> Result<TelemetrySnapshot> {
        let counters = self.counters();

        progress.state = CycleState::AcquireDevice;
        self.link.open().await?;
        progress.link_opened = true;

        self.status(StatusKind::Info, "Connecting to bridge");
        let serial = self.link.request_device_info().await?;
        debug!(serial = %serial, "Bridge identified");

        let mut tx = Transaction::begin(&self.store);
        let mut bridge = self
            .store
            .bridge(&serial)?
            .unwrap_or_else(|| BridgeInfo::new(serial.as_str()));

        progress.state = CycleState::EstablishSession;
        // A re-paired bridge gets a new key; only trust the cached one once
        // this process has talked to the pump.
        let cached_key = if counters.get(Counter::CommsSuccess) > 0 {
            bridge.link_key.clone()
        } else {
            None
        };
        let session = self.link.establish_session(cached_key.as_ref()).await?;
        let pump_mac = session.pump_mac;
        info!(pump = pump_mac & 0xFF_FFFF, "Pump session established");

        bridge.link_key = Some(session.key);
        tx.upsert_bridge(bridge.clone());

        let mut pump = self
            .store
            .pump(pump_mac)?
            .unwrap_or_else(|| PumpInfo::new(pump_mac));
        pump.last_query_at = Some(now);

        progress.state = CycleState::NegotiateChannel;
        let channel = self.link.negotiate_channel(pump.last_radio_channel).await?;
        if !channel.is_connected() {
            return Err(Error::NoChannel);
        }

        let connected = format!(
            "Connected on channel {}  RSSI: {}%",
            channel.channel, channel.rssi_percent
        );
        if channel.rssi_percent < MIN_RSSI_PCT {
            self.status(StatusKind::Info, connected);
            return Err(Error::WeakSignal {
                rssi_percent: channel.rssi_percent,
            });
        }

        counters.decrement(Counter::CommsConnectError);
        if channel.rssi_percent < WEAK_RSSI_PCT {
            counters.increment(Counter::CommsSignalError);
        } else {
            counters.decrement(Counter::CommsSignalError);
        }
        pump.last_radio_channel = channel.channel;
        self.status(StatusKind::Info, connected);
        debug!(
            channel = channel.channel,
            rssi = channel.rssi_percent,
            "Radio channel negotiated"
        );

        progress.state = CycleState::ReadStatus;
        let device_name = bridge.device_name();
        pump.device_name = Some(device_name.clone());

        let captured_at = progress.clock();
        let mut snapshot = self.link.read_status(captured_at).await?;
        snapshot.event_time = captured_at;
        snapshot.device_name = device_name;

        let drift = snapshot.drift();
        progress.clock_offset = Some(drift);
        debug!(
            offset_ms = drift.whole_milliseconds() as i64,
            "Time offset between pump and uploader"
        );

        progress.state = CycleState::Validate;
        let history =
            index_snapshots(self.store.history(pump_mac, captured_at - RETENTION)?);
        let snapshot = self.validator.validate(snapshot, &history);

        progress.state = CycleState::Commit;
        tx.upsert_pump(pump);
        tx.append_snapshot(pump_mac, snapshot.clone());
        tx.commit()?;

        self.report_snapshot(pump_mac, &snapshot, drift, progress);
        progress.state = CycleState::Done;
        Ok(snapshot)
    }

    /// Counter bookkeeping and status lines after a committed poll.
    fn report_snapshot(
        &self,
        pump_mac: u64,
        snapshot: &TelemetrySnapshot,
        drift: Duration,
        progress: &mut CycleProgress,
    ) {
        let counters = self.counters();
        counters.increment(Counter::CommsSuccess);
        counters.clear(Counter::CommsError);

        if snapshot.cgm_active {
            counters.clear(Counter::PumpCgmNa);
            counters.clear(Counter::PumpLostSensorError);

            if snapshot.cgm_warm_up {
                self.status(StatusKind::Cgm, "sensor is in warm-up phase");
            } else if snapshot.calibration_due_minutes == 0 {
                self.status(StatusKind::Cgm, "sensor calibration is due now!");
            } else if snapshot.sgv == 0 {
                self.status(StatusKind::Cgm, "sensor error (pump graph gap)");
            } else {
                counters.increment(Counter::CommsSgvSuccess);
                let offset = drift.whole_seconds();
                self.status(
                    StatusKind::Info,
                    format!(
                        "SGV: {}  At: {}  Pump: {}{}sec",
                        snapshot.sgv,
                        optional_clock_time(snapshot.cgm_reading_time()),
                        if offset > 0 { "+" } else { "" },
                        offset
                    ),
                );
                if snapshot.old_sgv_when_new_expected {
                    self.status(StatusKind::Warning, "Pump sent old SGV event");
                    // The reading may still arrive this period.
                    progress.interval =
                        POLL_PERIOD / self.context.settings.pump_away_divisor();
                }
            }
        } else {
            self.status(StatusKind::Cgm, "cgm n/a (pump lost sensor)");
            counters.increment(Counter::PumpCgmNa);
            if counters.get(Counter::CommsSgvSuccess) > 0 {
                counters.increment(Counter::PumpLostSensorError);
            }
        }

        self.report_treatments(snapshot);

        self.events.send(SyncEvent::PumpUpdated {
            pump_mac,
            event_time: snapshot.event_time,
        });
    }

    fn report_treatments(&self, snapshot: &TelemetrySnapshot) {
        if snapshot.flags.bgl {
            self.status(
                StatusKind::Treatment,
                format!("Recent finger BG: {}", snapshot.recent_finger_bgl),
            );
        }

        let bolus_at = optional_clock_time(snapshot.last_bolus_time);
        match snapshot.bolus_kind() {
            Some(BolusKind::Square { duration_minutes }) => self.status(
                StatusKind::Treatment,
                format!(
                    "Square bolus delivered: {}u Started: {} Duration: {} minutes",
                    snapshot.last_bolus_amount, bolus_at, duration_minutes
                ),
            ),
            Some(BolusKind::Dual) => self.status(
                StatusKind::Treatment,
                format!(
                    "Bolus (dual normal part): {}u At: {}",
                    snapshot.last_bolus_amount, bolus_at
                ),
            ),
            Some(BolusKind::Normal) => self.status(
                StatusKind::Treatment,
                format!("Bolus: {}u At: {}", snapshot.last_bolus_amount, bolus_at),
            ),
            None => {}
        }

        if snapshot.flags.temp_basal {
            let remaining = snapshot.temp_basal_minutes_remaining;
            let text = if remaining > 0 && snapshot.temp_basal_percentage > 0 {
                format!(
                    "Temp basal: {}% Remaining: {} minutes",
                    snapshot.temp_basal_percentage, remaining
                )
            } else if remaining > 0 {
                format!(
                    "Temp basal: {}u Remaining: {} minutes",
                    snapshot.temp_basal_rate, remaining
                )
            } else {
                "Temp basal stopped".to_string()
            };
            self.status(StatusKind::Treatment, text);
        }

        let changes = [
            ("Sensor", snapshot.sage.filter(|_| snapshot.flags.sage)),
            ("Reservoir", snapshot.cage.filter(|_| snapshot.flags.cage)),
            ("Pump battery", snapshot.battery.filter(|_| snapshot.flags.battery)),
        ];
        for (what, window) in changes {
            if let Some(window) = window {
                self.status(
                    StatusKind::Note,
                    format!(
                        "{} changed approx: {} - {}",
                        what,
                        note_time(window.after),
                        note_time(window.before)
                    ),
                );
            }
        }
    }

    /// Counter bookkeeping, retry interval and the single status line for a
    /// failed cycle.
    fn report_error(&self, err: &Error, progress: &mut CycleProgress) {
        let counters = self.counters();
        let settings = &self.context.settings;
        error!(error = %err, state = ?progress.state, "Poll cycle failed");

        match err {
            err if err.is_link_error() => {
                counters.increment(Counter::CommsConnectError);
                progress.interval = settings.pump_away_interval();
                if matches!(err, Error::WeakSignal { .. }) {
                    counters.increment(Counter::CommsSignalError);
                    self.status(
                        StatusKind::Warning,
                        "Warning: pump signal too weak. Is it nearby?",
                    );
                } else {
                    self.status(
                        StatusKind::Warning,
                        "Could not communicate with the pump. Is it nearby?",
                    );
                }
            }
            Error::PermissionDenied(reason) => {
                self.events.send(SyncEvent::PermissionRequired {
                    reason: reason.clone(),
                });
            }
            Error::TransportUnavailable(_) => {
                self.status(
                    StatusKind::Warning,
                    "USB connection error. Is the bridge plugged in?",
                );
            }
            Error::Store(_) | Error::DuplicateEventTime(_) | Error::InvalidData(_) => {
                self.status(StatusKind::Warning, format!("Database error: {}", err));
            }
            err if err.counts_as_comms_error() => {
                counters.increment(Counter::CommsError);
                progress.interval = err.retry_interval(progress.interval);
                self.status(StatusKind::Warning, comms_error_message(err));
            }
            err => self.status(StatusKind::Warning, err.to_string()),
        }
    }

    fn raise_warnings(&self) -> Vec<HealthWarning> {
        let counters = self.counters();
        let settings = &self.context.settings;

        if self.last_clock_offset.abs() > MAX_CLOCK_OFFSET {
            counters.increment(Counter::PumpClockError);
        }

        let warnings = settings.thresholds.evaluate(
            counters,
            settings.reduce_poll_on_pump_away,
            self.last_clock_offset,
        );
        for warning in &warnings {
            warn!(counter = warning.counter().name(), "{}", warning.message());
            self.status(StatusKind::Warning, warning.message());
            self.status(StatusKind::Help, warning.help());
        }
        warnings
    }
}

/// Build an index over snapshots that may span several pumps. Snapshots
/// sharing an event time with one already indexed are skipped.
fn index_snapshots(snapshots: Vec<TelemetrySnapshot>) -> PumpHistory {
    let mut history = PumpHistory::new();
    for snapshot in snapshots {
        if let Err(err) = history.insert(snapshot) {
            debug!(error = %err, "Skipping snapshot");
        }
    }
    history
}

fn comms_error_message(err: &Error) -> String {
    match err {
        Error::Io(_) => "Error connecting to bridge.".to_string(),
        Error::Checksum(_) => "Checksum error getting message from the bridge.".to_string(),
        Error::Encryption(_) => "Error decrypting messages from the bridge.".to_string(),
        Error::Timeout { .. } => "Timeout communicating with the bridge / pump.".to_string(),
        Error::UnexpectedMessage(message) => format!("Communication error: {}", message),
        Error::Hashing(_) => "Error connecting to bridge: Hashing error.".to_string(),
        other => other.to_string(),
    }
}

fn clock_time(t: OffsetDateTime) -> String {
    t.format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_else(|_| t.to_string())
}

fn optional_clock_time(t: Option<OffsetDateTime>) -> String {
    t.map_or_else(|| "unknown".to_string(), clock_time)
}

fn note_time(t: OffsetDateTime) -> String {
    t.format(format_description!(
        "[day] [month repr:short] [hour]:[minute]"
    ))
    .unwrap_or_else(|_| t.to_string())
}
