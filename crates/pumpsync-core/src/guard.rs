//! Cycle transaction with abort on drop.
//!
//! A sync cycle collects its writes (bridge key, pump record, snapshot) in a
//! [`Transaction`]. Nothing reaches the store until [`Transaction::commit`];
//! a transaction dropped on an early-exit path discards its changes.
//!
//! # Example
//!
//! ```
//! use pumpsync_core::guard::Transaction;
//! use pumpsync_core::mock::MemoryStore;
//! use pumpsync_core::traits::PersistentStore;
//! use pumpsync_types::PumpInfo;
//!
//! let store = MemoryStore::new();
//! {
//!     let mut tx = Transaction::begin(&store);
//!     tx.upsert_pump(PumpInfo::new(0x42));
//!     // Dropped without commit: nothing is written.
//! }
//! assert!(store.pump(0x42).unwrap().is_none());
//!
//! let mut tx = Transaction::begin(&store);
//! tx.upsert_pump(PumpInfo::new(0x42));
//! tx.commit().unwrap();
//! assert!(store.pump(0x42).unwrap().is_some());
//! ```

use tracing::{debug, warn};

use pumpsync_types::{BridgeInfo, PumpInfo, TelemetrySnapshot};

use crate::error::Result;
use crate::traits::PersistentStore;

/// Writes collected by a transaction, applied atomically by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Bridge record to insert or replace, keyed by serial.
    pub bridge: Option<BridgeInfo>,
    /// Pump record to insert or replace, keyed by MAC.
    pub pump: Option<PumpInfo>,
    /// Snapshots to append, with the MAC of the pump they belong to.
    pub snapshots: Vec<(u64, TelemetrySnapshot)>,
}

impl ChangeSet {
    /// Whether there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.bridge.is_none() && self.pump.is_none() && self.snapshots.is_empty()
    }

    /// Number of records in the change set.
    pub fn len(&self) -> usize {
        usize::from(self.bridge.is_some()) + usize::from(self.pump.is_some()) + self.snapshots.len()
    }
}

/// A guard that discards its collected writes when dropped uncommitted.
pub struct Transaction<'a, S: PersistentStore + ?Sized> {
    store: &'a S,
    changes: Option<ChangeSet>,
}

impl<'a, S: PersistentStore + ?Sized> Transaction<'a, S> {
    /// Start collecting writes for `store`.
    pub fn begin(store: &'a S) -> Self {
        Self {
            store,
            changes: Some(ChangeSet::default()),
        }
    }

    fn changes_mut(&mut self) -> &mut ChangeSet {
        self.changes.get_or_insert_with(ChangeSet::default)
    }

    /// Insert or replace the bridge record.
    pub fn upsert_bridge(&mut self, bridge: BridgeInfo) {
        self.changes_mut().bridge = Some(bridge);
    }

    /// Insert or replace the pump record.
    pub fn upsert_pump(&mut self, pump: PumpInfo) {
        self.changes_mut().pump = Some(pump);
    }

    /// Append a snapshot to a pump's history.
    pub fn append_snapshot(&mut self, pump_mac: u64, snapshot: TelemetrySnapshot) {
        self.changes_mut().snapshots.push((pump_mac, snapshot));
    }

    /// Apply every collected write in one store transaction.
    pub fn commit(mut self) -> Result<()> {
        let changes = self.changes.take().unwrap_or_default();
        let count = changes.len();
        self.store.commit(changes)?;
        debug!(records = count, "Transaction committed");
        Ok(())
    }

    /// Discard every collected write.
    pub fn abort(mut self) {
        if let Some(changes) = self.changes.take() {
            debug!(records = changes.len(), "Transaction aborted");
        }
    }
}

impl<S: PersistentStore + ?Sized> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        if let Some(changes) = self.changes.take()
            && !changes.is_empty()
        {
            warn!(
                records = changes.len(),
                "Transaction dropped without commit, changes discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryStore;
    use time::macros::datetime;

    #[test]
    fn test_commit_applies_all_changes() {
        let store = MemoryStore::new();
        let t = datetime!(2024-03-01 12:00:00 UTC);

        let mut tx = Transaction::begin(&store);
        tx.upsert_bridge(BridgeInfo::new("1234567"));
        tx.upsert_pump(PumpInfo::new(7));
        tx.append_snapshot(7, TelemetrySnapshot::new(t, t));
        tx.commit().unwrap();

        assert!(store.bridge("1234567").unwrap().is_some());
        assert!(store.pump(7).unwrap().is_some());
        assert_eq!(store.history(7, t - time::Duration::hours(1)).unwrap().len(), 1);
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn test_drop_discards_changes() {
        let store = MemoryStore::new();
        {
            let mut tx = Transaction::begin(&store);
            tx.upsert_bridge(BridgeInfo::new("1234567"));
        }
        assert!(store.bridge("1234567").unwrap().is_none());
        assert_eq!(store.commit_count(), 0);
    }

    #[test]
    fn test_abort_discards_changes() {
        let store = MemoryStore::new();
        let mut tx = Transaction::begin(&store);
        tx.upsert_pump(PumpInfo::new(1));
        tx.abort();
        assert!(store.pump(1).unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces_within_transaction() {
        let store = MemoryStore::new();
        let mut tx = Transaction::begin(&store);
        tx.upsert_pump(PumpInfo::new(1));
        let mut pump = PumpInfo::new(1);
        pump.last_radio_channel = 0x14;
        tx.upsert_pump(pump);
        tx.commit().unwrap();
        assert_eq!(store.pump(1).unwrap().unwrap().last_radio_channel, 0x14);
    }

    #[test]
    fn test_failed_commit_writes_nothing() {
        let store = MemoryStore::new();
        store.fail_commits(true);
        let mut tx = Transaction::begin(&store);
        tx.upsert_pump(PumpInfo::new(1));
        assert!(tx.commit().is_err());
        assert!(store.pump(1).unwrap().is_none());
    }

    #[test]
    fn test_change_set_len() {
        let mut changes = ChangeSet::default();
        assert!(changes.is_empty());
        changes.pump = Some(PumpInfo::new(1));
        assert_eq!(changes.len(), 1);
    }
}
