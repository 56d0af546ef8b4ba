//! Process-wide health counters.
//!
//! Counters track how communication with the bridge and pump has been going
//! across polls. They persist for the lifetime of the process and feed the
//! threshold warnings in [`crate::thresholds`].

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Named health counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    /// Recoverable communication failures (IO, checksum, timeout, ...).
    CommsError,
    /// Pump not reachable over the radio.
    CommsConnectError,
    /// Weak radio signal.
    CommsSignalError,
    /// Successful polls in this process.
    CommsSuccess,
    /// Polls that delivered a sensor glucose value.
    CommsSgvSuccess,
    /// Polls where the CGM was not active.
    PumpCgmNa,
    /// Polls where the pump lost the sensor after SGVs had been seen.
    PumpLostSensorError,
    /// Polls with an excessive pump clock offset.
    PumpClockError,
}

impl Counter {
    /// All counters, in storage order.
    pub const ALL: [Counter; 8] = [
        Counter::CommsError,
        Counter::CommsConnectError,
        Counter::CommsSignalError,
        Counter::CommsSuccess,
        Counter::CommsSgvSuccess,
        Counter::PumpCgmNa,
        Counter::PumpLostSensorError,
        Counter::PumpClockError,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Counter name as used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Counter::CommsError => "comms_error",
            Counter::CommsConnectError => "comms_connect_error",
            Counter::CommsSignalError => "comms_signal_error",
            Counter::CommsSuccess => "comms_success",
            Counter::CommsSgvSuccess => "comms_sgv_success",
            Counter::PumpCgmNa => "pump_cgm_na",
            Counter::PumpLostSensorError => "pump_lost_sensor_error",
            Counter::PumpClockError => "pump_clock_error",
        }
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub comms_error: u32,
    pub comms_connect_error: u32,
    pub comms_signal_error: u32,
    pub comms_success: u32,
    pub comms_sgv_success: u32,
    pub pump_cgm_na: u32,
    pub pump_lost_sensor_error: u32,
    pub pump_clock_error: u32,
}

/// Thread-safe set of non-negative counters.
#[derive(Debug, Default)]
pub struct HealthCounters {
    values: [AtomicU32; 8],
}

impl HealthCounters {
    /// Create counters that all read zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter.
    pub fn get(&self, counter: Counter) -> u32 {
        self.values[counter.index()].load(Ordering::Relaxed)
    }

    /// Increment a counter, returning the new value.
    pub fn increment(&self, counter: Counter) -> u32 {
        self.values[counter.index()]
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1)
    }

    /// Decrement a counter, stopping at zero. Returns the new value.
    pub fn decrement(&self, counter: Counter) -> u32 {
        let previous = self.values[counter.index()]
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Reset a counter to zero.
    pub fn clear(&self, counter: Counter) {
        self.values[counter.index()].store(0, Ordering::Relaxed);
    }

    /// If the counter reached `threshold`, clear it and return `true`.
    ///
    /// A threshold of zero never fires.
    pub fn take_if_at_least(&self, counter: Counter, threshold: u32) -> bool {
        if threshold == 0 {
            return false;
        }
        self.values[counter.index()]
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                (v >= threshold).then_some(0)
            })
            .is_ok()
    }

    /// Get a snapshot of the current counters.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            comms_error: self.get(Counter::CommsError),
            comms_connect_error: self.get(Counter::CommsConnectError),
            comms_signal_error: self.get(Counter::CommsSignalError),
            comms_success: self.get(Counter::CommsSuccess),
            comms_sgv_success: self.get(Counter::CommsSgvSuccess),
            pump_cgm_na: self.get(Counter::PumpCgmNa),
            pump_lost_sensor_error: self.get(Counter::PumpLostSensorError),
            pump_clock_error: self.get(Counter::PumpClockError),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in Counter::ALL {
            self.clear(counter);
        }
    }
}
