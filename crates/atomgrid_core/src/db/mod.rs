//! SQLite storage bootstrap and schema migration entry points.
//!
//! # Responsibility
//! - Open and configure SQLite connections for the atom, embedding and
//!   spatial stores.
//! - Apply schema migrations in deterministic order.
//! - Retry transient lock failures at the storage boundary.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - Stores must not read/write data before migrations succeed.

use parking_lot::Mutex;
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub mod migrations;
mod open;
pub mod retry;

pub use open::{open_db, open_db_in_memory, open_db_reader};
pub use retry::RetryPolicy;

pub type DbResult<T> = Result<T, DbError>;

/// Connection shared by every SQLite-backed store of one engine.
///
/// `rusqlite::Connection` is `Send` but not `Sync`; the mutex serializes
/// statements while letting stores live behind `Arc`.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Wraps a migrated connection for sharing between stores.
pub fn share(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
}

impl DbError {
    /// Whether the failure is a lock/busy condition worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::UnsupportedSchemaVersion { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
