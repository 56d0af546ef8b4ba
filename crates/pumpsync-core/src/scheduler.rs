//! Adaptive poll scheduling.
//!
//! The pump talks to the CGM transmitter every five minutes. Polling the pump
//! while that exchange is in progress fails, so poll times are aligned to
//! the last CGM reading seen in the history and kept clear of the window
//! right before the next expected reading.
//!
//! # Example
//!
//! ```
//! use pumpsync_core::history::PumpHistory;
//! use pumpsync_core::scheduler::{PollScheduler, POLL_PERIOD};
//! use time::{Duration, OffsetDateTime};
//!
//! let scheduler = PollScheduler::new();
//! let history = PumpHistory::new();
//! let now = OffsetDateTime::now_utc();
//!
//! // Without a recent CGM reading the pump is never considered busy.
//! assert!(scheduler.is_due(now, &history).is_none());
//!
//! let wake = scheduler.next_poll_time(now, POLL_PERIOD, now, &history, 0);
//! assert_eq!(wake, now + POLL_PERIOD + Duration::seconds(15));
//! ```

use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::history::PumpHistory;

/// Interval between CGM transmissions to the pump.
pub const POLL_PERIOD: Duration = Duration::milliseconds(300_000);

/// Time after a CGM transmission before the pump can be polled safely.
pub const GRACE: Duration = Duration::milliseconds(30_000);

/// Time before a CGM transmission during which polling is avoided.
pub const PRE_GRACE: Duration = Duration::milliseconds(45_000);

/// How far back a valid CGM reading can anchor the schedule.
pub const ANCHOR_WINDOW: Duration = Duration::minutes(24);

/// A requested poll closer than this to now is stale.
const STALE_REQUEST: Duration = Duration::seconds(10);

/// Offset applied when there is no CGM anchor to sync with.
const NO_ANCHOR_OFFSET: Duration = Duration::seconds(15);

/// Step used to move the poll time while CGM readings keep going missing.
const MISS_STEP: Duration = Duration::seconds(30);

/// Shortest wait that is still worth reporting as "busy".
const BUSY_MIN: Duration = Duration::seconds(5);

/// Computes poll times from the CGM reading history.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollScheduler;

impl PollScheduler {
    /// Create a scheduler.
    pub fn new() -> Self {
        Self
    }

    /// Wall-clock time of the most recent CGM reading among snapshots with
    /// valid CGM captured in the last 24 minutes.
    pub fn anchor(&self, now: OffsetDateTime, history: &PumpHistory) -> Option<OffsetDateTime> {
        history
            .since(now - ANCHOR_WINDOW)
            .filter(|s| s.flags.cgm)
            .filter_map(|s| s.cgm_reading_time())
            .max()
    }

    /// Earliest safe poll time if the pump is about to talk to the sensor.
    ///
    /// Returns `None` when polling now is fine.
    pub fn is_due(&self, now: OffsetDateTime, history: &PumpHistory) -> Option<OffsetDateTime> {
        let anchor = self.anchor(now, history)?;

        let first = anchor + POLL_PERIOD + GRACE;
        let expected = if now < first {
            first
        } else {
            let base = anchor + GRACE;
            base + periods(floor_periods(now - base) + 1)
        };

        let remaining = expected - now;
        if remaining > BUSY_MIN && remaining < GRACE + PRE_GRACE {
            debug!(%expected, remaining_secs = remaining.whole_seconds(), "Pump busy with sensor");
            Some(expected)
        } else {
            None
        }
    }

    /// Next wake time after a poll that started at `last_poll_started`.
    ///
    /// `requested_interval` is measured from the last actual poll slot.
    /// `miss_count` is the number of consecutive polls without CGM data; it
    /// shifts the poll time in 30 second steps to get out of a clash with
    /// the sensor schedule. The result is always strictly after `now`.
    pub fn next_poll_time(
        &self,
        last_poll_started: OffsetDateTime,
        requested_interval: Duration,
        now: OffsetDateTime,
        history: &PumpHistory,
        miss_count: u32,
    ) -> OffsetDateTime {
        let anchor = self.anchor(now, history);

        let base = match anchor {
            Some(cgm_time) => cgm_time + GRACE,
            None => last_poll_started,
        };
        let last_actual = base + periods(floor_periods(now - base));
        let next_actual = last_actual + POLL_PERIOD;
        let mut requested = last_actual + requested_interval;

        if requested - now < STALE_REQUEST {
            requested = next_actual;
        }

        if anchor.is_none() {
            requested += NO_ANCHOR_OFFSET;
        } else if miss_count > 2 {
            requested += MISS_STEP * ((miss_count - 2) % 3);
        }

        if requested > next_actual - GRACE - PRE_GRACE && requested < next_actual {
            requested = next_actual;
        }

        debug!(
            has_anchor = anchor.is_some(),
            miss_count,
            next_wake = %requested,
            "Computed next poll time"
        );
        requested
    }
}

/// Number of whole poll periods in `span`, rounded towards negative infinity.
fn floor_periods(span: Duration) -> i64 {
    let period = POLL_PERIOD.whole_milliseconds() as i64;
    (span.whole_milliseconds() as i64).div_euclid(period)
}

fn periods(count: i64) -> Duration {
    Duration::milliseconds(POLL_PERIOD.whole_milliseconds() as i64 * count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pumpsync_types::TelemetrySnapshot;
    use time::macros::datetime;

    const T: OffsetDateTime = datetime!(2024-03-01 12:00:00 UTC);

    /// History with one valid-CGM snapshot whose reading happened at `cgm`
    /// (no pump clock drift), captured `captured_after` later.
    fn history_with_anchor(cgm: OffsetDateTime, captured_after: Duration) -> PumpHistory {
        let at = cgm + captured_after;
        let mut snapshot = TelemetrySnapshot::new(at, at);
        snapshot.cgm_active = true;
        snapshot.flags.cgm = true;
        snapshot.cgm_device_time = Some(cgm);
        PumpHistory::from_snapshots(vec![snapshot]).unwrap()
    }

    #[test]
    fn test_anchor_uses_wall_clock_reading_time() {
        let at = T + Duration::minutes(1);
        let mut snapshot = TelemetrySnapshot::new(at, at + Duration::minutes(3));
        snapshot.flags.cgm = true;
        snapshot.cgm_device_time = Some(T + Duration::minutes(3));
        let history = PumpHistory::from_snapshots(vec![snapshot]).unwrap();

        assert_eq!(PollScheduler::new().anchor(at, &history), Some(T));
    }

    #[test]
    fn test_anchor_ignores_old_and_invalid_entries() {
        let scheduler = PollScheduler::new();
        let history = history_with_anchor(T, Duration::seconds(40));
        assert!(scheduler.anchor(T + Duration::minutes(25), &history).is_none());

        let at = T + Duration::seconds(40);
        let mut snapshot = TelemetrySnapshot::new(at, at);
        snapshot.cgm_device_time = Some(T);
        let history = PumpHistory::from_snapshots(vec![snapshot]).unwrap();
        assert!(scheduler.anchor(at, &history).is_none());
    }

    #[test]
    fn test_is_due_not_busy_without_anchor() {
        let scheduler = PollScheduler::new();
        assert!(scheduler.is_due(T, &PumpHistory::new()).is_none());
    }

    #[test]
    fn test_is_due_busy_right_before_next_reading() {
        let scheduler = PollScheduler::new();
        let history = history_with_anchor(T, Duration::seconds(40));

        // Next safe slot is T+330s; 29 seconds away.
        assert_eq!(
            scheduler.is_due(T + Duration::seconds(301), &history),
            Some(T + Duration::seconds(330))
        );
        // Under five seconds away is close enough to just poll.
        assert!(scheduler.is_due(T + Duration::seconds(326), &history).is_none());
        // Well before the pre-grace window.
        assert!(scheduler.is_due(T + Duration::seconds(200), &history).is_none());
    }

    #[test]
    fn test_is_due_advances_by_whole_periods() {
        let scheduler = PollScheduler::new();
        let history = history_with_anchor(T, Duration::seconds(40));

        // Two periods later the slot is T+630s.
        assert_eq!(
            scheduler.is_due(T + Duration::seconds(600), &history),
            Some(T + Duration::seconds(630))
        );
        assert!(scheduler.is_due(T + Duration::seconds(640), &history).is_none());
    }

    #[test]
    fn test_next_poll_time_aligned_to_anchor() {
        let scheduler = PollScheduler::new();
        let history = history_with_anchor(T, Duration::seconds(40));

        let wake = scheduler.next_poll_time(
            T,
            POLL_PERIOD,
            T + Duration::seconds(301),
            &history,
            0,
        );
        assert_eq!(wake, T + Duration::seconds(330));
    }

    #[test]
    fn test_next_poll_time_stale_request_snaps_to_next_slot() {
        let scheduler = PollScheduler::new();
        let history = history_with_anchor(T, Duration::seconds(40));

        // Last slot T+30s; a 60s retry would land at T+90s, already past.
        let wake = scheduler.next_poll_time(
            T,
            Duration::seconds(60),
            T + Duration::seconds(200),
            &history,
            0,
        );
        assert_eq!(wake, T + Duration::seconds(330));
    }

    #[test]
    fn test_next_poll_time_short_retry_kept_when_clear() {
        let scheduler = PollScheduler::new();
        let history = history_with_anchor(T, Duration::seconds(40));

        // Last slot T+30s; a 150s interval lands at T+180s, clear of the
        // window before T+330s.
        let wake = scheduler.next_poll_time(
            T,
            Duration::seconds(150),
            T + Duration::seconds(60),
            &history,
            0,
        );
        assert_eq!(wake, T + Duration::seconds(180));
    }

    #[test]
    fn test_next_poll_time_clamped_out_of_pre_grace() {
        let scheduler = PollScheduler::new();
        let history = history_with_anchor(T, Duration::seconds(40));

        // T+30s + 240s = T+270s falls inside (T+255s, T+330s).
        let wake = scheduler.next_poll_time(
            T,
            Duration::seconds(240),
            T + Duration::seconds(60),
            &history,
            0,
        );
        assert_eq!(wake, T + Duration::seconds(330));
    }

    #[test]
    fn test_next_poll_time_without_anchor() {
        let scheduler = PollScheduler::new();
        let wake = scheduler.next_poll_time(T, POLL_PERIOD, T, &PumpHistory::new(), 0);
        assert_eq!(wake, T + POLL_PERIOD + Duration::seconds(15));

        // Miss count does not apply without an anchor.
        let wake = scheduler.next_poll_time(T, POLL_PERIOD, T, &PumpHistory::new(), 4);
        assert_eq!(wake, T + POLL_PERIOD + Duration::seconds(15));
    }

    #[test]
    fn test_next_poll_time_miss_jitter() {
        let scheduler = PollScheduler::new();
        let history = history_with_anchor(T, Duration::seconds(40));
        let now = T + Duration::seconds(200);

        let wake = |miss| scheduler.next_poll_time(T, POLL_PERIOD, now, &history, miss);
        assert_eq!(wake(0), T + Duration::seconds(330));
        assert_eq!(wake(2), T + Duration::seconds(330));
        assert_eq!(wake(3), T + Duration::seconds(360));
        assert_eq!(wake(4), T + Duration::seconds(390));
        assert_eq!(wake(5), T + Duration::seconds(330));
        assert_eq!(wake(6), T + Duration::seconds(360));
    }

    #[test]
    fn test_next_poll_time_non_positive_interval_snaps() {
        let scheduler = PollScheduler::new();
        let history = history_with_anchor(T, Duration::seconds(40));
        let now = T + Duration::seconds(100);

        for interval in [Duration::ZERO, Duration::seconds(-90)] {
            let wake = scheduler.next_poll_time(T, interval, now, &history, 0);
            assert_eq!(wake, T + Duration::seconds(330));
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn next_poll_time_always_after_now(
                now_offset_ms in 0i64..1_440_000,
                last_poll_offset_ms in -600_000i64..600_000,
                interval_ms in -600_000i64..3_600_000,
                miss_count in 0u32..20,
                with_anchor in any::<bool>(),
                captured_after_s in 0i64..600,
            ) {
                let scheduler = PollScheduler::new();
                let history = if with_anchor {
                    history_with_anchor(T, Duration::seconds(captured_after_s))
                } else {
                    PumpHistory::new()
                };
                let now = T + Duration::milliseconds(now_offset_ms);
                let last_poll = now + Duration::milliseconds(last_poll_offset_ms);

                let wake = scheduler.next_poll_time(
                    last_poll,
                    Duration::milliseconds(interval_ms),
                    now,
                    &history,
                    miss_count,
                );
                prop_assert!(wake > now);
            }

            #[test]
            fn never_busy_without_recent_cgm(
                now_offset_ms in 0i64..86_400_000,
                cgm_age_min in 24i64..600,
            ) {
                let scheduler = PollScheduler::new();
                let now = T + Duration::milliseconds(now_offset_ms);

                // A valid CGM entry captured more than 24 minutes ago.
                let cgm = now - Duration::minutes(cgm_age_min);
                let history = history_with_anchor(cgm, Duration::ZERO);
                prop_assert!(scheduler.is_due(now, &history).is_none());

                prop_assert!(scheduler.is_due(now, &PumpHistory::new()).is_none());
            }

            #[test]
            fn busy_due_time_is_in_safe_window(
                now_offset_ms in 0i64..1_400_000,
            ) {
                let scheduler = PollScheduler::new();
                let history = history_with_anchor(T, Duration::ZERO);
                let now = T + Duration::milliseconds(now_offset_ms);

                if let Some(due) = scheduler.is_due(now, &history) {
                    let remaining = due - now;
                    prop_assert!(remaining > Duration::seconds(5));
                    prop_assert!(remaining < Duration::seconds(75));
                    prop_assert_eq!(floor_periods(due - (T + GRACE)) * 300_000,
                        (due - (T + GRACE)).whole_milliseconds() as i64);
                }
            }
        }
    }
}
