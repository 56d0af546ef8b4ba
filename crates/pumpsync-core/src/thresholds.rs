//! Threshold-gated health warnings.
//!
//! Each warning watches one counter from [`HealthCounters`]. When the counter
//! reaches its threshold the warning fires once and the counter is cleared.
//!
//! # Example
//!
//! ```
//! use pumpsync_core::metrics::{Counter, HealthCounters};
//! use pumpsync_core::thresholds::{HealthWarning, WarningThresholds};
//! use time::Duration;
//!
//! let counters = HealthCounters::new();
//! for _ in 0..4 {
//!     counters.increment(Counter::CommsError);
//! }
//!
//! let warnings = WarningThresholds::default().evaluate(&counters, false, Duration::ZERO);
//! assert_eq!(warnings, vec![HealthWarning::CommsErrors]);
//! assert_eq!(counters.get(Counter::CommsError), 0);
//! ```

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::metrics::{Counter, HealthCounters};

/// A warning raised when a health counter crosses its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthWarning {
    /// Pump clock keeps drifting away from wall-clock time.
    PumpClock {
        /// Last observed offset in whole seconds (positive = pump ahead).
        offset_seconds: i64,
    },
    /// Repeated comms or timeout errors.
    CommsErrors,
    /// Pump keeps losing the sensor.
    LostSensor,
    /// Connecting to the pump keeps failing.
    ConnectErrors,
    /// Radio signal is generally weak.
    WeakSignal,
}

impl HealthWarning {
    /// The counter this warning watches.
    pub fn counter(&self) -> Counter {
        match self {
            HealthWarning::PumpClock { .. } => Counter::PumpClockError,
            HealthWarning::CommsErrors => Counter::CommsError,
            HealthWarning::LostSensor => Counter::PumpLostSensorError,
            HealthWarning::ConnectErrors => Counter::CommsConnectError,
            HealthWarning::WeakSignal => Counter::CommsSignalError,
        }
    }

    /// Warning text for the status log.
    pub fn message(&self) -> String {
        match self {
            HealthWarning::PumpClock { offset_seconds } => format!(
                "Warning: Time difference between Pump and Uploader excessive. \
                 Pump is over {} minutes {} of time used by uploader.",
                offset_seconds.abs() / 60,
                if *offset_seconds > 0 { "ahead" } else { "behind" }
            ),
            HealthWarning::CommsErrors => {
                "Warning: multiple comms/timeout errors detected.".to_string()
            }
            HealthWarning::LostSensor => "Warning: SGV is unavailable from pump often. \
                 The pump is missing transmissions from the sensor."
                .to_string(),
            HealthWarning::ConnectErrors => {
                "Warning: connecting to pump is failing often.".to_string()
            }
            HealthWarning::WeakSignal => "Warning: RSSI radio signal from pump is generally \
                 weak and may increase errors."
                .to_string(),
        }
    }

    /// Suggested action to go with the warning.
    pub fn help(&self) -> &'static str {
        match self {
            HealthWarning::PumpClock { .. } => {
                "The uploader device should have the current time provided by network. \
                 Pump clock drifts forward and needs to be set to correct time occasionally."
            }
            HealthWarning::CommsErrors => {
                "Try: disconnecting and reconnecting the bridge / restarting the uploader / \
                 check pairing of the bridge with the pump."
            }
            HealthWarning::LostSensor => {
                "Keep pump on same side of body as sensor. \
                 Avoid using body sensor locations that can block radio signal."
            }
            HealthWarning::ConnectErrors | HealthWarning::WeakSignal => {
                "Keep pump nearby to the uploader. \
                 The body can block radio signals between pump and uploader."
            }
        }
    }
}

/// Counter thresholds at which warnings fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarningThresholds {
    pub comms_error: u32,
    /// Doubled when polling is reduced while the pump is away.
    pub connect_error: u32,
    pub signal_error: u32,
    pub lost_sensor: u32,
    pub clock_error: u32,
}

impl Default for WarningThresholds {
    fn default() -> Self {
        Self {
            comms_error: 4,
            connect_error: 8,
            signal_error: 8,
            lost_sensor: 8,
            clock_error: 8,
        }
    }
}

impl WarningThresholds {
    /// Threshold for `warning`, taking the pump-away setting into account.
    pub fn threshold_for(&self, warning: &HealthWarning, reduce_poll_on_pump_away: bool) -> u32 {
        match warning {
            HealthWarning::PumpClock { .. } => self.clock_error,
            HealthWarning::CommsErrors => self.comms_error,
            HealthWarning::LostSensor => self.lost_sensor,
            HealthWarning::ConnectErrors => {
                self.connect_error * if reduce_poll_on_pump_away { 2 } else { 1 }
            }
            HealthWarning::WeakSignal => self.signal_error,
        }
    }

    /// Evaluate every threshold, clearing the counters of the warnings that
    /// fire.
    ///
    /// `clock_offset` is the last observed pump clock offset, reported in the
    /// clock warning.
    pub fn evaluate(
        &self,
        counters: &HealthCounters,
        reduce_poll_on_pump_away: bool,
        clock_offset: Duration,
    ) -> Vec<HealthWarning> {
        let candidates = [
            HealthWarning::PumpClock {
                offset_seconds: clock_offset.whole_seconds(),
            },
            HealthWarning::CommsErrors,
            HealthWarning::LostSensor,
            HealthWarning::ConnectErrors,
            HealthWarning::WeakSignal,
        ];

        candidates
            .into_iter()
            .filter(|warning| {
                let threshold = self.threshold_for(warning, reduce_poll_on_pump_away);
                counters.take_if_at_least(warning.counter(), threshold)
            })
            .collect()
    }
}
