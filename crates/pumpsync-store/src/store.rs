//! Main store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, ErrorCode, OptionalExtension};
use time::OffsetDateTime;
use tracing::{debug, info};

use pumpsync_core::{ChangeSet, PersistentStore};
use pumpsync_types::{BridgeInfo, LinkKey, PumpInfo, TelemetrySnapshot};

use crate::error::{Error, Result};
use crate::models::{StoreStats, from_millis, to_millis};
use crate::queries::SnapshotQuery;
use crate::schema;

/// SQLite-based store for bridges, pumps and status snapshots.
pub struct Store {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Identity records
impl Store {
    /// Get a bridge by serial.
    pub fn get_bridge(&self, serial: &str) -> Result<Option<BridgeInfo>> {
        let conn = self.conn();
        let key: Option<Option<String>> = conn
            .query_row(
                "SELECT link_key FROM bridges WHERE serial = ?",
                [serial],
                |row| row.get(0),
            )
            .optional()?;

        let Some(key) = key else {
            return Ok(None);
        };
        let mut bridge = BridgeInfo::new(serial);
        bridge.link_key = key.as_deref().map(LinkKey::from_hex).transpose()?;
        Ok(Some(bridge))
    }

    /// Get a pump by MAC.
    pub fn get_pump(&self, mac: u64) -> Result<Option<PumpInfo>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT device_name, last_radio_channel, last_query_at FROM pumps WHERE mac = ?",
                [mac as i64],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(device_name, channel, last_query_at)| -> Result<PumpInfo> {
            Ok(PumpInfo {
                mac,
                device_name,
                last_radio_channel: channel as u8,
                last_query_at: last_query_at.map(from_millis).transpose()?,
            })
        })
        .transpose()
    }

    /// List every known pump, most recently queried first.
    pub fn list_pumps(&self) -> Result<Vec<PumpInfo>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT mac, device_name, last_radio_channel, last_query_at
             FROM pumps ORDER BY last_query_at DESC",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(mac, device_name, channel, last_query_at)| -> Result<PumpInfo> {
                Ok(PumpInfo {
                    mac: mac as u64,
                    device_name,
                    last_radio_channel: channel as u8,
                    last_query_at: last_query_at.map(from_millis).transpose()?,
                })
            })
            .collect()
    }
}

// Snapshot operations
impl Store {
    /// Query snapshots with filters.
    pub fn query_snapshots(&self, query: &SnapshotQuery) -> Result<Vec<TelemetrySnapshot>> {
        let sql = query.build_sql();
        let (_, params) = query.build_where();

        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let payloads = stmt
            .query_map(params_ref.as_slice(), |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        payloads
            .iter()
            .map(|payload| -> Result<TelemetrySnapshot> { Ok(serde_json::from_str(payload)?) })
            .collect()
    }

    /// Count stored snapshots, optionally for one pump.
    pub fn count_snapshots(&self, pump_mac: Option<u64>) -> Result<u64> {
        let conn = self.conn();
        let count: i64 = match pump_mac {
            Some(mac) => conn.query_row(
                "SELECT COUNT(*) FROM snapshots WHERE pump_mac = ?",
                [mac as i64],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?,
        };

        Ok(count as u64)
    }

    /// Apply a change set in one SQLite transaction.
    pub fn apply(&self, changes: &ChangeSet) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = to_millis(OffsetDateTime::now_utc());

        if let Some(bridge) = &changes.bridge {
            tx.execute(
                "INSERT INTO bridges (serial, link_key, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(serial) DO UPDATE SET
                    link_key = ?2,
                    updated_at = ?3",
                rusqlite::params![
                    bridge.serial,
                    bridge.link_key.as_ref().map(LinkKey::to_hex),
                    now
                ],
            )?;
        }

        if let Some(pump) = &changes.pump {
            tx.execute(
                "INSERT INTO pumps (mac, device_name, last_radio_channel, last_query_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(mac) DO UPDATE SET
                    device_name = ?2,
                    last_radio_channel = ?3,
                    last_query_at = ?4",
                rusqlite::params![
                    pump.mac as i64,
                    pump.device_name,
                    pump.last_radio_channel,
                    pump.last_query_at.map(to_millis)
                ],
            )?;
        }

        for (mac, snapshot) in &changes.snapshots {
            let payload = serde_json::to_string(snapshot)?;
            tx.execute(
                "INSERT INTO snapshots (pump_mac, event_time, payload) VALUES (?1, ?2, ?3)",
                rusqlite::params![*mac as i64, to_millis(snapshot.event_time), payload],
            )
            .map_err(|err| match err.sqlite_error_code() {
                Some(ErrorCode::ConstraintViolation) if is_unique_violation(&err) => {
                    Error::DuplicateSnapshot {
                        pump_mac: *mac,
                        event_time: snapshot.event_time,
                    }
                }
                _ => Error::Database(err),
            })?;
        }

        tx.commit()?;
        debug!(records = changes.len(), "Change set applied");
        Ok(())
    }

    /// Delete snapshots captured before `cutoff`.
    pub fn delete_before(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM snapshots WHERE event_time < ?",
            [to_millis(cutoff)],
        )?;
        if removed > 0 {
            info!("Removed {} outdated snapshots", removed);
        }
        Ok(removed)
    }

    /// Row counts and snapshot time range.
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn();
        let count = |table: &str| -> Result<u64> {
            let n: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
            Ok(n as u64)
        };

        let (oldest, newest): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(event_time), MAX(event_time) FROM snapshots",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(StoreStats {
            bridges: count("bridges")?,
            pumps: count("pumps")?,
            snapshots: count("snapshots")?,
            oldest: oldest.map(from_millis).transpose()?,
            newest: newest.map(from_millis).transpose()?,
        })
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl PersistentStore for Store {
    fn bridge(&self, serial: &str) -> pumpsync_core::Result<Option<BridgeInfo>> {
        Ok(self.get_bridge(serial)?)
    }

    fn pump(&self, mac: u64) -> pumpsync_core::Result<Option<PumpInfo>> {
        Ok(self.get_pump(mac)?)
    }

    fn history(
        &self,
        mac: u64,
        since: OffsetDateTime,
    ) -> pumpsync_core::Result<Vec<TelemetrySnapshot>> {
        Ok(self.query_snapshots(&SnapshotQuery::new().pump(mac).after(since))?)
    }

    fn recent(&self, since: OffsetDateTime) -> pumpsync_core::Result<Vec<TelemetrySnapshot>> {
        Ok(self.query_snapshots(&SnapshotQuery::new().after(since))?)
    }

    fn commit(&self, changes: ChangeSet) -> pumpsync_core::Result<()> {
        Ok(self.apply(&changes)?)
    }

    fn purge_before(&self, cutoff: OffsetDateTime) -> pumpsync_core::Result<usize> {
        Ok(self.delete_before(cutoff)?)
    }
}
