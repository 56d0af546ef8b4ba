//! Database schema and migrations.

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize(conn: &Connection) -> Result<()> {
    let version = get_schema_version(conn)?;

    if version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if version < SCHEMA_VERSION {
        migrate(conn, version)?;
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 =
        conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?;

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?)",
        [version],
    )?;
    Ok(())
}

/// Create the initial schema (version 1).
///
/// Times are unix milliseconds. MACs are stored as the bit pattern of the
/// 64-bit value.
fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        -- USB bridges, keyed by serial
        CREATE TABLE IF NOT EXISTS bridges (
            serial TEXT PRIMARY KEY,
            link_key TEXT,
            updated_at INTEGER NOT NULL
        );

        -- Paired pumps
        CREATE TABLE IF NOT EXISTS pumps (
            mac INTEGER PRIMARY KEY,
            device_name TEXT,
            last_radio_channel INTEGER NOT NULL DEFAULT 0,
            last_query_at INTEGER
        );

        -- Validated status snapshots
        CREATE TABLE IF NOT EXISTS snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pump_mac INTEGER NOT NULL REFERENCES pumps(mac),
            event_time INTEGER NOT NULL,
            payload TEXT NOT NULL,
            UNIQUE(pump_mac, event_time)
        );
        CREATE INDEX IF NOT EXISTS idx_snapshots_event_time
            ON snapshots(event_time);
        "#,
    )?;

    Ok(())
}

/// Run migrations from old_version to current.
fn migrate(conn: &Connection, old_version: i32) -> Result<()> {
    tracing::info!(from = old_version, to = SCHEMA_VERSION, "Migrating database schema");
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}
