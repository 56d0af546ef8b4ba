//! In-memory ordered history of a pump's telemetry snapshots.
//!
//! [`PumpHistory`] is loaded from the persistent store at the start of a
//! cycle and gives the validator and scheduler range queries by event time
//! plus secondary lookups for already-validated SGV readings and boluses.

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

use time::{Duration, OffsetDateTime};

use pumpsync_types::TelemetrySnapshot;

use crate::error::{Error, Result};

/// Snapshots kept in the store; older entries are purged every cycle.
pub const RETENTION: Duration = Duration::hours(48);

/// Chronological snapshots of one pump, keyed by event time.
#[derive(Debug, Clone, Default)]
pub struct PumpHistory {
    entries: BTreeMap<OffsetDateTime, TelemetrySnapshot>,
    /// CGM reading instants (pump clock) of snapshots marked as a valid SGV.
    sgv_readings: HashSet<OffsetDateTime>,
    /// `(last bolus time, reference)` of snapshots marked as a valid bolus.
    boluses: HashSet<(OffsetDateTime, u8)>,
}

impl PumpHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a history from snapshots in any order.
    pub fn from_snapshots(snapshots: impl IntoIterator<Item = TelemetrySnapshot>) -> Result<Self> {
        let mut history = Self::new();
        for snapshot in snapshots {
            history.insert(snapshot)?;
        }
        Ok(history)
    }

    /// Add a snapshot. Fails if a snapshot with the same event time exists.
    pub fn insert(&mut self, snapshot: TelemetrySnapshot) -> Result<()> {
        if self.entries.contains_key(&snapshot.event_time) {
            return Err(Error::DuplicateEventTime(snapshot.event_time));
        }
        self.index(&snapshot);
        self.entries.insert(snapshot.event_time, snapshot);
        Ok(())
    }

    fn index(&mut self, snapshot: &TelemetrySnapshot) {
        if snapshot.flags.sgv
            && let Some(cgm_time) = snapshot.cgm_device_time
        {
            self.sgv_readings.insert(cgm_time);
        }
        if snapshot.flags.bolus
            && let Some(bolus_time) = snapshot.last_bolus_time
        {
            self.boluses.insert((bolus_time, snapshot.last_bolus_reference));
        }
    }

    fn rebuild_indexes(&mut self) {
        self.sgv_readings.clear();
        self.boluses.clear();
        let entries = std::mem::take(&mut self.entries);
        for snapshot in entries.values() {
            self.index(snapshot);
        }
        self.entries = entries;
    }

    /// Number of snapshots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest snapshot, if any.
    pub fn latest(&self) -> Option<&TelemetrySnapshot> {
        self.entries.values().next_back()
    }

    /// Snapshots in chronological order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &TelemetrySnapshot> {
        self.entries.values()
    }

    /// Snapshots with `event_time > cutoff`, oldest first.
    pub fn since(
        &self,
        cutoff: OffsetDateTime,
    ) -> impl DoubleEndedIterator<Item = &TelemetrySnapshot> {
        self.entries
            .range((Bound::Excluded(cutoff), Bound::Unbounded))
            .map(|(_, s)| s)
    }

    /// Snapshots with `event_time >= start`, oldest first.
    pub fn starting_at(
        &self,
        start: OffsetDateTime,
    ) -> impl DoubleEndedIterator<Item = &TelemetrySnapshot> {
        self.entries.range(start..).map(|(_, s)| s)
    }

    /// Whether a snapshot for this CGM reading was already marked as a valid SGV.
    pub fn has_valid_sgv_at(&self, cgm_device_time: OffsetDateTime) -> bool {
        self.sgv_readings.contains(&cgm_device_time)
    }

    /// Whether this bolus was already marked as valid.
    pub fn has_valid_bolus(&self, bolus_time: OffsetDateTime, reference: u8) -> bool {
        self.boluses.contains(&(bolus_time, reference))
    }

    /// Remove snapshots older than `cutoff`, returning how many were dropped.
    pub fn purge_before(&mut self, cutoff: OffsetDateTime) -> usize {
        let kept = self.entries.split_off(&cutoff);
        let removed = self.entries.len();
        self.entries = kept;
        if removed > 0 {
            self.rebuild_indexes();
        }
        removed
    }
}
