//! Query builder for stored snapshots.
//!
//! # Example
//!
//! ```
//! use pumpsync_store::{SnapshotQuery, Store};
//! use time::{Duration, OffsetDateTime};
//!
//! let store = Store::open_in_memory()?;
//! let yesterday = OffsetDateTime::now_utc() - Duration::hours(24);
//!
//! let query = SnapshotQuery::new()
//!     .pump(0x0023_F745_12AB_CDEF)
//!     .after(yesterday)
//!     .limit(12);
//! let snapshots = store.query_snapshots(&query)?;
//! assert!(snapshots.is_empty());
//! # Ok::<(), pumpsync_store::Error>(())
//! ```

use time::OffsetDateTime;

use crate::models::to_millis;

/// Fluent query builder for [`Store::query_snapshots`](crate::Store::query_snapshots).
///
/// By default, queries return every snapshot of every pump, oldest first.
#[derive(Debug, Default, Clone)]
pub struct SnapshotQuery {
    /// Filter by pump MAC.
    pub pump_mac: Option<u64>,
    /// Only snapshots captured strictly after this time.
    pub after: Option<OffsetDateTime>,
    /// Only snapshots captured at or before this time.
    pub until: Option<OffsetDateTime>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Order by event time descending.
    pub newest_first: bool,
}

impl SnapshotQuery {
    /// Create a new query with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by pump MAC.
    pub fn pump(mut self, mac: u64) -> Self {
        self.pump_mac = Some(mac);
        self
    }

    /// Only snapshots captured strictly after `time`.
    pub fn after(mut self, time: OffsetDateTime) -> Self {
        self.after = Some(time);
        self
    }

    /// Only snapshots captured at or before `time`.
    pub fn until(mut self, time: OffsetDateTime) -> Self {
        self.until = Some(time);
        self
    }

    /// Limit the number of results.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Newest snapshots first.
    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    /// Build the SQL WHERE clause and parameters.
    pub(crate) fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(mac) = self.pump_mac {
            conditions.push("pump_mac = ?");
            params.push(Box::new(mac as i64));
        }

        if let Some(after) = self.after {
            conditions.push("event_time > ?");
            params.push(Box::new(to_millis(after)));
        }

        if let Some(until) = self.until {
            conditions.push("event_time <= ?");
            params.push(Box::new(to_millis(until)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    /// Build the full SQL query.
    pub(crate) fn build_sql(&self) -> String {
        let (where_clause, _) = self.build_where();
        let order = if self.newest_first { "DESC" } else { "ASC" };

        let mut sql = format!(
            "SELECT pump_mac, payload FROM snapshots {} ORDER BY event_time {}",
            where_clause, order
        );

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        sql
    }
}
