//! Classification of new snapshots against the pump history.
//!
//! The pump status message restates the same last bolus, temp basal, finger
//! BG and sensor reading for many polls in a row. [`TelemetryValidator`]
//! decides which fields of a freshly read snapshot are new clinical events
//! and which repeat something already recorded.
//!
//! All windows are measured back from the new snapshot's `event_time`.
//!
//! # Example
//!
//! ```
//! use pumpsync_core::history::PumpHistory;
//! use pumpsync_core::validation::TelemetryValidator;
//! use pumpsync_types::TelemetrySnapshot;
//! use time::OffsetDateTime;
//!
//! let now = OffsetDateTime::now_utc();
//! let mut snapshot = TelemetrySnapshot::new(now, now);
//! snapshot.recent_finger_bgl = 112;
//!
//! let validated = TelemetryValidator::default().validate(snapshot, &PumpHistory::new());
//! assert!(validated.flags.bgl);
//! ```

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use pumpsync_types::{ChangeWindow, TelemetrySnapshot};

use crate::history::PumpHistory;
use crate::scheduler::{GRACE, POLL_PERIOD};

/// Time windows used by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// A CGM reading older than this (pump clock) is stale.
    pub sgv_max_age: Duration,
    /// A finger BG with the same value inside this window is a repeat.
    pub bgl_window: Duration,
    /// Bolusing time remaining above which a bolus counts as extended.
    pub extended_bolus_min_remaining: u16,
    /// How far back to look for the start of a temp basal.
    pub temp_basal_window: Duration,
    /// How late a temp basal must stop to count as cancelled early.
    pub temp_basal_stop_tolerance: Duration,
    /// A sensor warm-up within this window of a reported change is the same change.
    pub sage_warm_up_window: Duration,
    /// How far back the change window of a warm-up starts.
    pub sage_lookback: Duration,
    /// Transmitter battery above which a jump means a new transmitter.
    pub sage_battery_min: u8,
    /// How far back to look for a lower reservoir, battery or transmitter level.
    pub change_window: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            sgv_max_age: POLL_PERIOD + GRACE / 2,
            bgl_window: Duration::minutes(20),
            extended_bolus_min_remaining: 10,
            temp_basal_window: Duration::hours(24),
            temp_basal_stop_tolerance: Duration::seconds(60),
            sage_warm_up_window: Duration::minutes(130),
            sage_lookback: Duration::minutes(12),
            sage_battery_min: 70,
            change_window: Duration::hours(12),
        }
    }
}

/// Marks new clinical events on a snapshot.
#[derive(Debug, Clone, Default)]
pub struct TelemetryValidator {
    config: ValidatorConfig,
}

impl TelemetryValidator {
    /// Create a new validator with the given configuration.
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Get the validator configuration.
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Classify `snapshot` against `history`.
    ///
    /// Only the snapshot's flags and derived fields change; any values they
    /// held on input are discarded.
    pub fn validate(
        &self,
        mut snapshot: TelemetrySnapshot,
        history: &PumpHistory,
    ) -> TelemetrySnapshot {
        snapshot.clear_derived();

        self.check_sgv(&mut snapshot, history);
        self.check_bgl(&mut snapshot, history);
        self.check_bolus(&mut snapshot, history);
        self.check_temp_basal(&mut snapshot, history);
        self.check_sage(&mut snapshot, history);
        self.check_cage(&mut snapshot, history);
        self.check_battery(&mut snapshot, history);

        snapshot
    }

    fn check_sgv(&self, snapshot: &mut TelemetrySnapshot, history: &PumpHistory) {
        if !snapshot.cgm_active {
            return;
        }
        snapshot.flags.cgm = true;

        let Some(cgm_time) = snapshot.cgm_device_time else {
            return;
        };

        if snapshot.device_time - cgm_time > self.config.sgv_max_age {
            snapshot.old_sgv_when_new_expected = true;
        } else if !snapshot.cgm_warm_up && snapshot.sgv > 0 {
            snapshot.flags.sgv = !history.has_valid_sgv_at(cgm_time);
        }
    }

    fn check_bgl(&self, snapshot: &mut TelemetrySnapshot, history: &PumpHistory) {
        if snapshot.recent_finger_bgl == 0 {
            return;
        }
        let repeated = history
            .since(snapshot.event_time - self.config.bgl_window)
            .any(|s| s.recent_finger_bgl == snapshot.recent_finger_bgl);
        snapshot.flags.bgl = !repeated;
    }

    fn check_bolus(&self, snapshot: &mut TelemetrySnapshot, history: &PumpHistory) {
        let Some(bolus_time) = snapshot.last_bolus_time else {
            return;
        };
        if history.has_valid_bolus(bolus_time, snapshot.last_bolus_reference) {
            return;
        }
        snapshot.flags.bolus = true;

        let min_remaining = self.config.extended_bolus_min_remaining;
        if snapshot.bolusing_reference == snapshot.last_bolus_reference
            && snapshot.bolusing_minutes_remaining > min_remaining
        {
            snapshot.flags.bolus_dual = true;
            return;
        }

        let earliest = history.iter().find(|s| {
            s.bolusing_reference == snapshot.last_bolus_reference
                && s.bolusing_minutes_remaining > min_remaining
        });
        if let Some(first) = earliest {
            let expected = (first.device_time - bolus_time)
                + Duration::minutes(i64::from(first.bolusing_minutes_remaining));
            let elapsed = snapshot.device_time - bolus_time;
            let duration = expected.min(elapsed);

            snapshot.flags.bolus_square = true;
            snapshot.last_bolus_duration =
                duration.whole_minutes().clamp(0, i64::from(u16::MAX)) as u16;
        }
    }

    fn check_temp_basal(&self, snapshot: &mut TelemetrySnapshot, history: &PumpHistory) {
        let recent: Vec<&TelemetrySnapshot> = history
            .since(snapshot.event_time - self.config.temp_basal_window)
            .rev()
            .collect();

        if snapshot.temp_basal_minutes_remaining > 0 {
            let same_setting = |s: &TelemetrySnapshot| {
                s.temp_basal_rate == snapshot.temp_basal_rate
                    && s.temp_basal_percentage == snapshot.temp_basal_percentage
            };

            // Walk back through the snapshots that restate this temp basal.
            let mut minutes = snapshot.temp_basal_minutes_remaining;
            let mut boundary = None;
            for entry in &recent {
                if entry.temp_basal_minutes_remaining < minutes
                    || !same_setting(entry)
                    || entry.flags.temp_basal
                {
                    boundary = Some(*entry);
                    break;
                }
                minutes = entry.temp_basal_minutes_remaining;
            }
            let boundary = boundary.or_else(|| recent.last().copied());

            // Nothing in the window to compare against: not a new temp basal.
            if let Some(entry) = boundary
                && !(entry.flags.temp_basal && same_setting(entry))
            {
                snapshot.flags.temp_basal = true;
                snapshot.temp_basal_after = Some(entry.event_time);
            }
        } else if let Some(newest) = recent.first() {
            let overrun = snapshot.device_time - newest.temp_basal_end();
            if overrun < -self.config.temp_basal_stop_tolerance {
                snapshot.flags.temp_basal = true;
                snapshot.temp_basal_after = Some(newest.event_time);
            }
        }
    }

    fn check_sage(&self, snapshot: &mut TelemetrySnapshot, history: &PumpHistory) {
        let now = snapshot.event_time;

        if snapshot.cgm_warm_up {
            let already_reported = history
                .since(now - self.config.sage_warm_up_window)
                .any(|s| s.flags.sage);
            if already_reported {
                return;
            }
            let after = history
                .since(now - self.config.sage_lookback)
                .next_back()
                .map_or(now, |s| s.event_time);
            snapshot.flags.sage = true;
            snapshot.sage = Some(ChangeWindow { after, before: now });
        } else if snapshot.cgm_active
            && snapshot.transmitter_battery_pct > self.config.sage_battery_min
        {
            let lower = history
                .since(now - self.config.change_window)
                .rev()
                .find(|s| {
                    s.cgm_active && s.transmitter_battery_pct < snapshot.transmitter_battery_pct
                })
                .map(|s| s.event_time);
            if let Some(window) = unreported_change(history, lower, now, |s| s.flags.sage) {
                snapshot.flags.sage = true;
                snapshot.sage = Some(window);
            }
        }
    }

    fn check_cage(&self, snapshot: &mut TelemetrySnapshot, history: &PumpHistory) {
        let now = snapshot.event_time;
        let lower = history
            .since(now - self.config.change_window)
            .rev()
            .find(|s| s.reservoir_amount < snapshot.reservoir_amount)
            .map(|s| s.event_time);
        if let Some(window) = unreported_change(history, lower, now, |s| s.flags.cage) {
            snapshot.flags.cage = true;
            snapshot.cage = Some(window);
        }
    }

    fn check_battery(&self, snapshot: &mut TelemetrySnapshot, history: &PumpHistory) {
        let now = snapshot.event_time;
        let lower = history
            .since(now - self.config.change_window)
            .rev()
            .find(|s| s.pump_battery_pct < snapshot.pump_battery_pct)
            .map(|s| s.event_time);
        if let Some(window) = unreported_change(history, lower, now, |s| s.flags.battery) {
            snapshot.flags.battery = true;
            snapshot.battery = Some(window);
        }
    }
}

/// Change window starting at `after`, unless a snapshot from `after` on
/// already reported the change.
fn unreported_change(
    history: &PumpHistory,
    after: Option<OffsetDateTime>,
    before: OffsetDateTime,
    reported: impl Fn(&TelemetrySnapshot) -> bool,
) -> Option<ChangeWindow> {
    let after = after?;
    if history.starting_at(after).any(reported) {
        return None;
    }
    Some(ChangeWindow { after, before })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pumpsync_types::BolusKind;
    use time::macros::datetime;

    const T: OffsetDateTime = datetime!(2024-03-01 12:00:00 UTC);

    fn snapshot(offset: Duration) -> TelemetrySnapshot {
        let at = T + offset;
        let mut s = TelemetrySnapshot::new(at, at);
        s.reservoir_amount = 100.0;
        s.pump_battery_pct = 75;
        s
    }

    fn validate(s: TelemetrySnapshot, history: &PumpHistory) -> TelemetrySnapshot {
        TelemetryValidator::default().validate(s, history)
    }

    fn history_of(entries: Vec<TelemetrySnapshot>) -> PumpHistory {
        PumpHistory::from_snapshots(entries).unwrap()
    }

    // --- CGM / SGV ---

    #[test]
    fn test_cgm_inactive_sets_nothing() {
        let mut s = snapshot(Duration::ZERO);
        s.sgv = 120;
        s.cgm_device_time = Some(T);
        let v = validate(s, &PumpHistory::new());
        assert!(!v.flags.cgm);
        assert!(!v.flags.sgv);
    }

    #[test]
    fn test_new_sgv_is_valid() {
        let mut s = snapshot(Duration::ZERO);
        s.cgm_active = true;
        s.sgv = 120;
        s.cgm_device_time = Some(T - Duration::minutes(2));
        let v = validate(s, &PumpHistory::new());
        assert!(v.flags.cgm);
        assert!(v.flags.sgv);
        assert!(!v.old_sgv_when_new_expected);
    }

    #[test]
    fn test_repeated_sgv_is_not_valid() {
        let mut prev = snapshot(-Duration::minutes(1));
        prev.cgm_active = true;
        prev.flags.cgm = true;
        prev.flags.sgv = true;
        prev.sgv = 120;
        prev.cgm_device_time = Some(T - Duration::minutes(3));
        let history = history_of(vec![prev.clone()]);

        let mut s = prev.clone();
        s.event_time = T;
        s.device_time = T;
        let v = validate(s, &history);
        assert!(v.flags.cgm);
        assert!(!v.flags.sgv);
    }

    #[test]
    fn test_old_sgv_when_new_expected() {
        let mut s = snapshot(Duration::ZERO);
        s.cgm_active = true;
        s.sgv = 120;
        // 316 seconds is past the 315 second limit.
        s.cgm_device_time = Some(T - Duration::seconds(316));
        let v = validate(s, &PumpHistory::new());
        assert!(v.old_sgv_when_new_expected);
        assert!(!v.flags.sgv);

        let mut s = snapshot(Duration::ZERO);
        s.cgm_active = true;
        s.sgv = 120;
        s.cgm_device_time = Some(T - Duration::seconds(315));
        let v = validate(s, &PumpHistory::new());
        assert!(!v.old_sgv_when_new_expected);
        assert!(v.flags.sgv);
    }

    #[test]
    fn test_warm_up_and_zero_sgv_not_valid() {
        let mut s = snapshot(Duration::ZERO);
        s.cgm_active = true;
        s.cgm_warm_up = true;
        s.sgv = 120;
        s.cgm_device_time = Some(T);
        assert!(!validate(s, &PumpHistory::new()).flags.sgv);

        let mut s = snapshot(Duration::ZERO);
        s.cgm_active = true;
        s.sgv = 0;
        s.cgm_device_time = Some(T);
        assert!(!validate(s, &PumpHistory::new()).flags.sgv);
    }

    // --- Finger BG ---

    #[test]
    fn test_bgl_new_and_repeated() {
        let mut prev = snapshot(-Duration::minutes(19));
        prev.recent_finger_bgl = 140;
        let history = history_of(vec![prev]);

        let mut s = snapshot(Duration::ZERO);
        s.recent_finger_bgl = 140;
        assert!(!validate(s.clone(), &history).flags.bgl);

        s.recent_finger_bgl = 141;
        assert!(validate(s, &history).flags.bgl);
    }

    #[test]
    fn test_bgl_window_is_exclusive() {
        let mut prev = snapshot(-Duration::minutes(20));
        prev.recent_finger_bgl = 140;
        let history = history_of(vec![prev]);

        let mut s = snapshot(Duration::ZERO);
        s.recent_finger_bgl = 140;
        assert!(validate(s, &history).flags.bgl);
    }

    #[test]
    fn test_bgl_zero_never_valid() {
        assert!(!validate(snapshot(Duration::ZERO), &PumpHistory::new()).flags.bgl);
    }

    // --- Bolus ---

    fn with_bolus(mut s: TelemetrySnapshot, at: OffsetDateTime, reference: u8) -> TelemetrySnapshot {
        s.last_bolus_time = Some(at);
        s.last_bolus_reference = reference;
        s.last_bolus_amount = 2.5;
        s
    }

    #[test]
    fn test_normal_bolus() {
        let s = with_bolus(snapshot(Duration::ZERO), T - Duration::minutes(2), 4);
        let v = validate(s, &PumpHistory::new());
        assert_eq!(v.bolus_kind(), Some(BolusKind::Normal));
    }

    #[test]
    fn test_no_bolus_time_not_marked() {
        let v = validate(snapshot(Duration::ZERO), &PumpHistory::new());
        assert_eq!(v.bolus_kind(), None);
    }

    #[test]
    fn test_repeated_bolus_not_marked() {
        let mut prev = with_bolus(snapshot(-Duration::minutes(5)), T - Duration::minutes(7), 4);
        prev.flags.bolus = true;
        let history = history_of(vec![prev]);

        let s = with_bolus(snapshot(Duration::ZERO), T - Duration::minutes(7), 4);
        assert_eq!(validate(s, &history).bolus_kind(), None);

        // Same time, different reference is a different bolus.
        let s = with_bolus(snapshot(Duration::ZERO), T - Duration::minutes(7), 5);
        assert_eq!(validate(s, &history).bolus_kind(), Some(BolusKind::Normal));
    }

    #[test]
    fn test_dual_bolus() {
        let mut s = with_bolus(snapshot(Duration::ZERO), T - Duration::minutes(1), 9);
        s.bolusing_reference = 9;
        s.bolusing_minutes_remaining = 45;
        let v = validate(s, &PumpHistory::new());
        assert_eq!(v.bolus_kind(), Some(BolusKind::Dual));
        assert!(!v.flags.bolus_square);
    }

    #[test]
    fn test_dual_needs_more_than_ten_minutes() {
        let mut s = with_bolus(snapshot(Duration::ZERO), T - Duration::minutes(1), 9);
        s.bolusing_reference = 9;
        s.bolusing_minutes_remaining = 10;
        assert_eq!(
            validate(s, &PumpHistory::new()).bolus_kind(),
            Some(BolusKind::Normal)
        );
    }

    #[test]
    fn test_square_bolus_duration() {
        let start = T - Duration::minutes(60);
        // First seen bolusing 55 minutes into a 60 minute square bolus.
        let mut first = snapshot(-Duration::minutes(55));
        first.bolusing_reference = 3;
        first.bolusing_minutes_remaining = 55;
        let mut later = snapshot(-Duration::minutes(30));
        later.bolusing_reference = 3;
        later.bolusing_minutes_remaining = 30;
        let history = history_of(vec![first, later]);

        let s = with_bolus(snapshot(Duration::ZERO), start, 3);
        let v = validate(s, &history);
        assert_eq!(
            v.bolus_kind(),
            Some(BolusKind::Square {
                duration_minutes: 60
            })
        );
    }

    #[test]
    fn test_square_bolus_stopped_early_is_clamped() {
        let start = T - Duration::minutes(20);
        let mut first = snapshot(-Duration::minutes(15));
        first.bolusing_reference = 3;
        first.bolusing_minutes_remaining = 100;
        let history = history_of(vec![first]);

        let s = with_bolus(snapshot(Duration::ZERO), start, 3);
        let v = validate(s, &history);
        assert_eq!(
            v.bolus_kind(),
            Some(BolusKind::Square {
                duration_minutes: 20
            })
        );
    }

    // --- Temp basal ---

    fn with_temp(mut s: TelemetrySnapshot, rate: f32, pct: u8, remaining: u16) -> TelemetrySnapshot {
        s.temp_basal_rate = rate;
        s.temp_basal_percentage = pct;
        s.temp_basal_minutes_remaining = remaining;
        s
    }

    #[test]
    fn test_temp_basal_new_after_plain_basal() {
        let before = snapshot(-Duration::minutes(5));
        let history = history_of(vec![before]);

        let s = with_temp(snapshot(Duration::ZERO), 0.0, 50, 60);
        let v = validate(s, &history);
        assert!(v.flags.temp_basal);
        assert_eq!(v.temp_basal_after, Some(T - Duration::minutes(5)));
    }

    #[test]
    fn test_temp_basal_already_reported() {
        let before = snapshot(-Duration::minutes(10));
        let mut reported = with_temp(snapshot(-Duration::minutes(5)), 0.0, 50, 60);
        reported.flags.temp_basal = true;
        let history = history_of(vec![before, reported]);

        let s = with_temp(snapshot(Duration::ZERO), 0.0, 50, 55);
        assert!(!validate(s, &history).flags.temp_basal);
    }

    #[test]
    fn test_temp_basal_restarted_with_same_setting() {
        // Remaining time went up: a new temp basal with the same percentage.
        let mut reported = with_temp(snapshot(-Duration::minutes(55)), 0.0, 50, 60);
        reported.flags.temp_basal = true;
        let ending = with_temp(snapshot(-Duration::minutes(5)), 0.0, 50, 10);
        let history = history_of(vec![reported, ending]);

        let s = with_temp(snapshot(Duration::ZERO), 0.0, 50, 60);
        let v = validate(s, &history);
        assert!(v.flags.temp_basal);
        assert_eq!(v.temp_basal_after, Some(T - Duration::minutes(5)));
    }

    #[test]
    fn test_temp_basal_boundary_reported_with_same_setting() {
        let mut reported = with_temp(snapshot(-Duration::minutes(5)), 0.0, 50, 10);
        reported.flags.temp_basal = true;
        let history = history_of(vec![reported]);

        let s = with_temp(snapshot(Duration::ZERO), 0.0, 50, 60);
        assert!(!validate(s, &history).flags.temp_basal);
    }

    #[test]
    fn test_temp_basal_changed_rate() {
        let mut reported = with_temp(snapshot(-Duration::minutes(5)), 1.2, 0, 60);
        reported.flags.temp_basal = true;
        let history = history_of(vec![reported]);

        let s = with_temp(snapshot(Duration::ZERO), 0.8, 0, 55);
        assert!(validate(s, &history).flags.temp_basal);
    }

    #[test]
    fn test_temp_basal_chain_exhausted_uses_oldest() {
        let a = with_temp(snapshot(-Duration::minutes(10)), 0.0, 70, 60);
        let b = with_temp(snapshot(-Duration::minutes(5)), 0.0, 70, 55);
        let history = history_of(vec![a, b]);

        let s = with_temp(snapshot(Duration::ZERO), 0.0, 70, 50);
        let v = validate(s, &history);
        assert!(v.flags.temp_basal);
        assert_eq!(v.temp_basal_after, Some(T - Duration::minutes(10)));
    }

    #[test]
    fn test_temp_basal_without_history() {
        let s = with_temp(snapshot(Duration::ZERO), 0.0, 50, 60);
        let v = validate(s, &PumpHistory::new());
        assert!(!v.flags.temp_basal);
        assert_eq!(v.temp_basal_after, None);
    }

    #[test]
    fn test_temp_basal_with_only_stale_history() {
        // The only earlier snapshot is outside the 24 hour window.
        let old = snapshot(-Duration::hours(25));
        let history = history_of(vec![old]);

        let v = validate(with_temp(snapshot(Duration::ZERO), 0.0, 50, 60), &history);
        assert!(!v.flags.temp_basal);
        assert_eq!(v.temp_basal_after, None);
    }

    #[test]
    fn test_temp_basal_cancelled_early() {
        // 30 minutes left five minutes ago, none left now.
        let mut running = with_temp(snapshot(-Duration::minutes(5)), 0.0, 50, 30);
        running.flags.temp_basal = true;
        let history = history_of(vec![running]);

        let v = validate(snapshot(Duration::ZERO), &history);
        assert!(v.flags.temp_basal);
        assert_eq!(v.temp_basal_after, Some(T - Duration::minutes(5)));
    }

    #[test]
    fn test_temp_basal_ran_to_completion() {
        let running = with_temp(snapshot(-Duration::minutes(5)), 0.0, 50, 5);
        let history = history_of(vec![running]);
        assert!(!validate(snapshot(Duration::ZERO), &history).flags.temp_basal);
    }

    // --- Sensor age ---

    #[test]
    fn test_sage_warm_up() {
        let before = snapshot(-Duration::minutes(5));
        let history = history_of(vec![before]);

        let mut s = snapshot(Duration::ZERO);
        s.cgm_active = true;
        s.cgm_warm_up = true;
        let v = validate(s, &history);
        assert!(v.flags.sage);
        assert_eq!(
            v.sage,
            Some(ChangeWindow {
                after: T - Duration::minutes(5),
                before: T
            })
        );
    }

    #[test]
    fn test_sage_warm_up_without_recent_entry() {
        let mut s = snapshot(Duration::ZERO);
        s.cgm_warm_up = true;
        let v = validate(s, &PumpHistory::new());
        assert_eq!(v.sage, Some(ChangeWindow { after: T, before: T }));
    }

    #[test]
    fn test_sage_warm_up_already_reported() {
        let mut reported = snapshot(-Duration::minutes(120));
        reported.flags.sage = true;
        let history = history_of(vec![reported]);

        let mut s = snapshot(Duration::ZERO);
        s.cgm_warm_up = true;
        assert!(!validate(s, &history).flags.sage);
    }

    #[test]
    fn test_sage_transmitter_battery_jump() {
        let mut old = snapshot(-Duration::minutes(30));
        old.cgm_active = true;
        old.transmitter_battery_pct = 25;
        let history = history_of(vec![old]);

        let mut s = snapshot(Duration::ZERO);
        s.cgm_active = true;
        s.transmitter_battery_pct = 100;
        let v = validate(s, &history);
        assert!(v.flags.sage);
        assert_eq!(
            v.sage,
            Some(ChangeWindow {
                after: T - Duration::minutes(30),
                before: T
            })
        );
    }

    #[test]
    fn test_sage_battery_jump_ignores_inactive_cgm_entries() {
        let mut old = snapshot(-Duration::minutes(30));
        old.transmitter_battery_pct = 25;
        let history = history_of(vec![old]);

        let mut s = snapshot(Duration::ZERO);
        s.cgm_active = true;
        s.transmitter_battery_pct = 100;
        assert!(!validate(s, &history).flags.sage);
    }

    // --- Reservoir and battery ---

    #[test]
    fn test_cage_reservoir_refill() {
        let mut before = snapshot(-Duration::minutes(10));
        before.reservoir_amount = 80.0;
        let history = history_of(vec![before]);

        let mut s = snapshot(Duration::ZERO);
        s.reservoir_amount = 150.0;
        let v = validate(s, &history);
        assert!(v.flags.cage);
        let window = v.cage.unwrap();
        assert_eq!(window.after, T - Duration::minutes(10));
        assert_eq!(window.before, T);
        assert_eq!(window.duration(), Duration::minutes(10));
    }

    #[test]
    fn test_cage_consumption_not_a_change() {
        let mut before = snapshot(-Duration::minutes(10));
        before.reservoir_amount = 150.0;
        let history = history_of(vec![before]);

        let mut s = snapshot(Duration::ZERO);
        s.reservoir_amount = 80.0;
        assert!(!validate(s, &history).flags.cage);
    }

    #[test]
    fn test_cage_reported_once() {
        let mut before = snapshot(-Duration::minutes(10));
        before.reservoir_amount = 80.0;
        let mut reported = snapshot(-Duration::minutes(5));
        reported.reservoir_amount = 150.0;
        reported.flags.cage = true;
        let history = history_of(vec![before, reported]);

        let mut s = snapshot(Duration::ZERO);
        s.reservoir_amount = 149.5;
        assert!(!validate(s, &history).flags.cage);
    }

    #[test]
    fn test_battery_change() {
        let mut before = snapshot(-Duration::minutes(10));
        before.pump_battery_pct = 0;
        let history = history_of(vec![before]);

        let mut s = snapshot(Duration::ZERO);
        s.pump_battery_pct = 100;
        let v = validate(s, &history);
        assert!(v.flags.battery);
        assert_eq!(v.battery.map(|w| w.after), Some(T - Duration::minutes(10)));
    }

    #[test]
    fn test_change_window_limited_to_twelve_hours() {
        let mut before = snapshot(-Duration::hours(13));
        before.pump_battery_pct = 0;
        let history = history_of(vec![before]);

        let mut s = snapshot(Duration::ZERO);
        s.pump_battery_pct = 100;
        assert!(!validate(s, &history).flags.battery);
    }

    #[test]
    fn test_input_flags_are_discarded() {
        let mut s = snapshot(Duration::ZERO);
        s.flags.cage = true;
        s.old_sgv_when_new_expected = true;
        let v = validate(s, &PumpHistory::new());
        assert!(!v.flags.any_event());
        assert!(!v.old_sgv_when_new_expected);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        struct Reading {
            sgv: u16,
            cgm_active: bool,
            warm_up: bool,
            bgl: u16,
            bolus_ref: u8,
            bolusing_ref: u8,
            bolusing_remaining: u16,
            temp_pct: u8,
            temp_remaining: u16,
            transmitter: u8,
            reservoir: u8,
            battery: u8,
        }

        fn reading() -> impl Strategy<Value = Reading> {
            (
                (0u16..3, any::<bool>(), prop::bool::weighted(0.1), 0u16..3),
                (0u8..3, 0u8..3, 0u16..60),
                (0u8..3, 0u16..90),
                (0u8..4, 0u8..4, 0u8..4),
            )
                .prop_map(
                    |(
                        (sgv, cgm_active, warm_up, bgl),
                        (bolus_ref, bolusing_ref, bolusing_remaining),
                        (temp_pct, temp_remaining),
                        (transmitter, reservoir, battery),
                    )| Reading {
                        sgv: sgv * 60,
                        cgm_active,
                        warm_up,
                        bgl: bgl * 70,
                        bolus_ref,
                        bolusing_ref,
                        bolusing_remaining,
                        temp_pct: temp_pct * 50,
                        temp_remaining,
                        transmitter: transmitter * 30,
                        reservoir: reservoir * 40,
                        battery: battery * 30,
                    },
                )
        }

        fn to_snapshot(index: usize, r: &Reading) -> TelemetrySnapshot {
            let at = T + Duration::minutes(5 * index as i64);
            let mut s = TelemetrySnapshot::new(at, at);
            s.cgm_active = r.cgm_active;
            s.cgm_warm_up = r.warm_up;
            s.cgm_device_time = Some(at - Duration::minutes(1));
            s.sgv = r.sgv;
            s.recent_finger_bgl = r.bgl;
            s.last_bolus_time = Some(T + Duration::minutes(r.bolus_ref as i64));
            s.last_bolus_reference = r.bolus_ref;
            s.bolusing_reference = r.bolusing_ref;
            s.bolusing_minutes_remaining = r.bolusing_remaining;
            s.temp_basal_percentage = r.temp_pct;
            s.temp_basal_minutes_remaining = r.temp_remaining;
            s.transmitter_battery_pct = r.transmitter;
            s.reservoir_amount = f32::from(r.reservoir);
            s.pump_battery_pct = r.battery;
            s
        }

        proptest! {
            #[test]
            fn revalidating_newest_entry_raises_no_event(
                readings in prop::collection::vec(reading(), 1..12)
            ) {
                let validator = TelemetryValidator::default();
                let mut history = PumpHistory::new();
                for (i, r) in readings.iter().enumerate() {
                    let validated = validator.validate(to_snapshot(i, r), &history);
                    history.insert(validated).unwrap();
                }

                let newest = history.latest().unwrap().clone();
                let again = validator.validate(newest, &history);
                prop_assert!(!again.flags.any_event(), "flags: {:?}", again.flags);
            }

            #[test]
            fn bolus_kinds_are_exclusive(
                readings in prop::collection::vec(reading(), 1..12)
            ) {
                let validator = TelemetryValidator::default();
                let mut history = PumpHistory::new();
                for (i, r) in readings.iter().enumerate() {
                    let v = validator.validate(to_snapshot(i, r), &history);
                    prop_assert!(!(v.flags.bolus_square && v.flags.bolus_dual));
                    prop_assert!(v.flags.bolus || !(v.flags.bolus_square || v.flags.bolus_dual));
                    history.insert(v).unwrap();
                }
            }
        }
    }
}
