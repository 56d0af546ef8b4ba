//! Local persistence for pumpsync.
//!
//! SQLite storage for bridge link keys, pump records and validated status
//! snapshots. [`Store`] implements [`pumpsync_core::PersistentStore`], so the
//! sync orchestrator writes through it directly.
//!
//! # Example
//!
//! ```no_run
//! use pumpsync_store::{SnapshotQuery, Store};
//!
//! let store = Store::open_default()?;
//!
//! let latest = store.query_snapshots(&SnapshotQuery::new().newest_first().limit(1))?;
//! # Ok::<(), pumpsync_store::Error>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::StoreStats;
pub use queries::SnapshotQuery;
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/pumpsync/data.db`
/// - macOS: `~/Library/Application Support/pumpsync/data.db`
/// - Windows: `C:\Users\<user>\AppData\Local\pumpsync\data.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("pumpsync")
        .join("data.db")
}
