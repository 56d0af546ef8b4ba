//! Sync settings and the shared context injected into the orchestrator.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::error::{Error, Result};
use crate::metrics::HealthCounters;
use crate::thresholds::WarningThresholds;

/// Downstream service that receives poll results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadTarget {
    Nightscout,
    Xdrip,
}

impl UploadTarget {
    /// Default delay after a cycle before uploading.
    pub fn default_delay(&self) -> Duration {
        match self {
            UploadTarget::Nightscout => Duration::milliseconds(1000),
            UploadTarget::Xdrip => Duration::milliseconds(500),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UploadTarget::Nightscout => "Nightscout",
            UploadTarget::Xdrip => "xDrip+",
        }
    }
}

impl std::fmt::Display for UploadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An upload requested after every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadRequest {
    pub target: UploadTarget,
    pub delay: Duration,
}

impl UploadRequest {
    /// Request for `target` with its default delay.
    pub fn new(target: UploadTarget) -> Self {
        Self {
            target,
            delay: target.default_delay(),
        }
    }
}

/// Polling behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Standard interval between polls.
    pub poll_interval: Duration,
    /// Interval used while the pump battery is low.
    pub low_battery_poll_interval: Duration,
    /// Poll twice as often while the pump is out of reach.
    pub reduce_poll_on_pump_away: bool,
    /// Uploads requested after every cycle.
    pub uploads: Vec<UploadRequest>,
    pub thresholds: WarningThresholds,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::milliseconds(300_000),
            low_battery_poll_interval: Duration::milliseconds(900_000),
            reduce_poll_on_pump_away: false,
            uploads: vec![UploadRequest::new(UploadTarget::Nightscout)],
            thresholds: WarningThresholds::default(),
        }
    }
}

impl SyncSettings {
    /// Interval after the pump could not be reached.
    pub fn pump_away_interval(&self) -> Duration {
        self.poll_interval / self.pump_away_divisor()
    }

    /// Divisor applied to intervals while the pump is away.
    pub fn pump_away_divisor(&self) -> i32 {
        if self.reduce_poll_on_pump_away { 2 } else { 1 }
    }

    /// Check the settings for values the scheduler cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.poll_interval.is_positive() {
            return Err(Error::invalid_config("poll_interval must be positive"));
        }
        if !self.low_battery_poll_interval.is_positive() {
            return Err(Error::invalid_config(
                "low_battery_poll_interval must be positive",
            ));
        }
        if self.uploads.iter().any(|u| u.delay.is_negative()) {
            return Err(Error::invalid_config("upload delay cannot be negative"));
        }
        Ok(())
    }
}

/// State shared by every cycle: settings and process-wide counters.
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    pub settings: SyncSettings,
    pub counters: Arc<HealthCounters>,
}

impl SyncContext {
    /// Create a context with fresh counters.
    pub fn new(settings: SyncSettings) -> Self {
        Self {
            settings,
            counters: Arc::new(HealthCounters::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SyncSettings::default();
        assert_eq!(settings.poll_interval, Duration::minutes(5));
        assert_eq!(settings.low_battery_poll_interval, Duration::minutes(15));
        assert!(!settings.reduce_poll_on_pump_away);
        assert_eq!(
            settings.uploads,
            vec![UploadRequest {
                target: UploadTarget::Nightscout,
                delay: Duration::seconds(1)
            }]
        );
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_pump_away_interval() {
        let mut settings = SyncSettings::default();
        assert_eq!(settings.pump_away_interval(), Duration::minutes(5));
        settings.reduce_poll_on_pump_away = true;
        assert_eq!(settings.pump_away_interval(), Duration::seconds(150));
    }

    #[test]
    fn test_validate_rejects_non_positive_intervals() {
        let settings = SyncSettings {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(Error::InvalidConfig(_))));

        let settings = SyncSettings {
            low_battery_poll_interval: Duration::seconds(-1),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_upload_target_delays() {
        assert_eq!(UploadTarget::Xdrip.default_delay(), Duration::milliseconds(500));
        assert_eq!(UploadTarget::Nightscout.to_string(), "Nightscout");
        let json = serde_json::to_string(&UploadTarget::Xdrip).unwrap();
        assert_eq!(json, "\"xdrip\"");
    }

    #[test]
    fn test_context_shares_counters() {
        let context = SyncContext::default();
        let clone = context.clone();
        context
            .counters
            .increment(crate::metrics::Counter::CommsSuccess);
        assert_eq!(
            clone.counters.get(crate::metrics::Counter::CommsSuccess),
            1
        );
    }
}
