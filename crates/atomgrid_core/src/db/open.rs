//! Connection bootstrap utilities for SQLite.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections.
//! - Configure connection pragmas required by core behavior.
//! - Trigger schema migrations before returning a usable connection.
//!
//! # Invariants
//! - Returned connections have `foreign_keys=ON` and a busy timeout.
//! - Returned read-write connections have migrations fully applied.
//! - Reader connections are read-only and never migrate; open them after the
//!   writer so the schema is already current.

use super::migrations::apply_migrations;
use super::DbResult;
use log::{error, info};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::{Duration, Instant};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a SQLite database file and applies all pending migrations.
///
/// # Side effects
/// - Enables WAL journaling for file databases.
/// - Emits `db_open` logging events with duration and status.
pub fn open_db(path: impl AsRef<Path>) -> DbResult<Connection> {
    open_with("file", || Connection::open(path), |conn| bootstrap_connection(conn, true))
}

/// Opens a read-only connection to a database file already opened with
/// [`open_db`].
///
/// Under WAL this connection reads a consistent snapshot while the writer
/// commits, so range queries and inserts do not wait on each other.
pub fn open_db_reader(path: impl AsRef<Path>) -> DbResult<Connection> {
    open_with(
        "reader",
        || {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        },
        |conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            Ok(())
        },
    )
}

/// Opens an in-memory SQLite database and applies all pending migrations.
pub fn open_db_in_memory() -> DbResult<Connection> {
    open_with("memory", Connection::open_in_memory, |conn| {
        bootstrap_connection(conn, false)
    })
}

fn open_with(
    mode: &str,
    open: impl FnOnce() -> rusqlite::Result<Connection>,
    bootstrap: impl FnOnce(&mut Connection) -> DbResult<()>,
) -> DbResult<Connection> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode={mode}");

    let mut conn = match open() {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={mode} duration_ms={} error_code=db_open_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    match bootstrap(&mut conn) {
        Ok(()) => {
            info!(
                "event=db_open module=db status=ok mode={mode} duration_ms={}",
                started_at.elapsed().as_millis()
            );
            Ok(conn)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={mode} duration_ms={} error_code=db_bootstrap_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

fn bootstrap_connection(conn: &mut Connection, wal: bool) -> DbResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    if wal {
        // journal_mode returns a row, so it cannot go through execute_batch.
        conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))?;
    }
    conn.busy_timeout(BUSY_TIMEOUT)?;
    apply_migrations(conn)?;
    Ok(())
}
