//! Telemetry snapshot read from the pump through the bridge.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Validity flags set by the validator on a freshly read snapshot.
///
/// `cgm` describes sensor state; every other flag marks a new clinical event
/// first seen in this snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ValidityFlags {
    pub cgm: bool,
    pub sgv: bool,
    pub bgl: bool,
    pub bolus: bool,
    pub bolus_square: bool,
    pub bolus_dual: bool,
    pub temp_basal: bool,
    pub sage: bool,
    pub cage: bool,
    pub battery: bool,
}

impl ValidityFlags {
    /// Whether any event flag is raised. The `cgm` state flag is ignored.
    #[must_use]
    pub fn any_event(&self) -> bool {
        self.sgv
            || self.bgl
            || self.bolus
            || self.bolus_square
            || self.bolus_dual
            || self.temp_basal
            || self.sage
            || self.cage
            || self.battery
    }
}

/// Time window in which a consumable change (sensor, reservoir, battery)
/// happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChangeWindow {
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub after: OffsetDateTime,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub before: OffsetDateTime,
}

impl ChangeWindow {
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.before - self.after
    }
}

/// How a validated bolus was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BolusKind {
    /// Delivered at once.
    Normal,
    /// Extended over `duration_minutes`.
    Square { duration_minutes: u16 },
    /// Normal part delivered, extended part still running.
    Dual,
}

/// One status read from the pump.
///
/// Created per poll, mutated only by the validator in the same cycle and
/// immutable once it is appended to the pump history.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TelemetrySnapshot {
    /// Wall-clock instant the snapshot was captured.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub event_time: OffsetDateTime,
    /// Instant reported by the pump's own clock.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub device_time: OffsetDateTime,
    /// Name of the bridge that read the snapshot.
    pub device_name: String,

    pub cgm_active: bool,
    pub cgm_warm_up: bool,
    /// CGM reading instant in the pump clock.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339::option"))]
    pub cgm_device_time: Option<OffsetDateTime>,
    /// Sensor glucose value in mg/dL (0 = absent).
    pub sgv: u16,
    pub calibration_due_minutes: u16,
    /// Most recent finger-stick BG in mg/dL (0 = none).
    pub recent_finger_bgl: u16,

    pub last_bolus_amount: f32,
    /// Last bolus instant in the pump clock.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339::option"))]
    pub last_bolus_time: Option<OffsetDateTime>,
    pub last_bolus_reference: u8,
    /// Square bolus duration in minutes, derived by the validator.
    pub last_bolus_duration: u16,
    pub bolusing_reference: u8,
    pub bolusing_minutes_remaining: u16,

    pub temp_basal_rate: f32,
    pub temp_basal_percentage: u8,
    pub temp_basal_minutes_remaining: u16,

    pub transmitter_battery_pct: u8,
    pub reservoir_amount: f32,
    pub pump_battery_pct: u8,

    pub flags: ValidityFlags,
    /// CGM reading is older than the device schedule allows.
    pub old_sgv_when_new_expected: bool,
    pub sage: Option<ChangeWindow>,
    pub cage: Option<ChangeWindow>,
    pub battery: Option<ChangeWindow>,
    /// Start of the temp basal event (event time of the chain boundary).
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339::option"))]
    pub temp_basal_after: Option<OffsetDateTime>,
}

impl TelemetrySnapshot {
    /// Create an empty snapshot captured at `event_time`.
    pub fn new(event_time: OffsetDateTime, device_time: OffsetDateTime) -> Self {
        Self {
            event_time,
            device_time,
            device_name: String::new(),
            cgm_active: false,
            cgm_warm_up: false,
            cgm_device_time: None,
            sgv: 0,
            calibration_due_minutes: 0,
            recent_finger_bgl: 0,
            last_bolus_amount: 0.0,
            last_bolus_time: None,
            last_bolus_reference: 0,
            last_bolus_duration: 0,
            bolusing_reference: 0,
            bolusing_minutes_remaining: 0,
            temp_basal_rate: 0.0,
            temp_basal_percentage: 0,
            temp_basal_minutes_remaining: 0,
            transmitter_battery_pct: 0,
            reservoir_amount: 0.0,
            pump_battery_pct: 0,
            flags: ValidityFlags::default(),
            old_sgv_when_new_expected: false,
            sage: None,
            cage: None,
            battery: None,
            temp_basal_after: None,
        }
    }

    /// Pump clock offset from wall-clock time (`device_time - event_time`).
    #[must_use]
    pub fn drift(&self) -> Duration {
        self.device_time - self.event_time
    }

    /// CGM reading instant converted to wall-clock time.
    #[must_use]
    pub fn cgm_reading_time(&self) -> Option<OffsetDateTime> {
        self.cgm_device_time.map(|t| t - self.drift())
    }

    /// Predicted end of the running temp basal, in the pump clock.
    #[must_use]
    pub fn temp_basal_end(&self) -> OffsetDateTime {
        self.device_time + Duration::minutes(i64::from(self.temp_basal_minutes_remaining))
    }

    /// Delivery kind of a validated bolus, `None` when no new bolus was seen.
    #[must_use]
    pub fn bolus_kind(&self) -> Option<BolusKind> {
        if !self.flags.bolus {
            return None;
        }
        Some(if self.flags.bolus_dual {
            BolusKind::Dual
        } else if self.flags.bolus_square {
            BolusKind::Square {
                duration_minutes: self.last_bolus_duration,
            }
        } else {
            BolusKind::Normal
        })
    }

    /// Reset every field the validator derives.
    pub fn clear_derived(&mut self) {
        self.flags = ValidityFlags::default();
        self.old_sgv_when_new_expected = false;
        self.last_bolus_duration = 0;
        self.sage = None;
        self.cage = None;
        self.battery = None;
        self.temp_basal_after = None;
    }
}
