//! Ordered schema migrations for the atom, embedding and spatial tables.
//!
//! # Invariants
//! - Versions start at 1 and increase by exactly one per step.
//! - All pending steps run in one transaction; `PRAGMA user_version` moves
//!   with each step, so a failed run leaves the previous version intact.
//! - A database newer than this binary is refused, never downgraded.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::{Connection, Transaction};

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "atoms",
        sql: include_str!("0001_atoms.sql"),
    },
    Migration {
        version: 2,
        name: "vectors",
        sql: include_str!("0002_vectors.sql"),
    },
    Migration {
        version: 3,
        name: "lookups",
        sql: include_str!("0003_lookups.sql"),
    },
];

/// Schema version this binary writes.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Brings `conn` up to [`latest_version`].
///
/// # Errors
/// - `UnsupportedSchemaVersion` when the file was written by a newer binary.
/// - `Sqlite` when a step fails; nothing from the run is kept.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let from = schema_version(conn)?;
    let latest = latest_version();
    if from > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from,
            latest_supported: latest,
        });
    }

    let pending: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|migration| migration.version > from)
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for migration in &pending {
        apply_one(&tx, migration)?;
    }
    tx.commit()?;

    info!(
        "event=db_migrate module=db status=ok from={from} to={latest} steps={}",
        pending.len()
    );
    Ok(())
}

fn apply_one(tx: &Transaction<'_>, migration: &Migration) -> DbResult<()> {
    tx.execute_batch(migration.sql)?;
    tx.pragma_update(None, "user_version", migration.version)?;
    info!(
        "event=db_migrate module=db status=step version={} name={}",
        migration.version, migration.name
    );
    Ok(())
}

fn schema_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::{apply_migrations, latest_version, schema_version, MIGRATIONS};
    use rusqlite::Connection;

    #[test]
    fn versions_are_contiguous_from_one() {
        for (position, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.version as usize, position + 1, "{}", migration.name);
        }
    }

    #[test]
    fn partial_schema_is_upgraded_step_by_step() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0].sql).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();

        apply_migrations(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), latest_version());

        apply_migrations(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), latest_version());
    }

    #[test]
    fn backlog_step_flags_existing_text_roots() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0].sql).unwrap();
        conn.execute_batch(MIGRATIONS[1].sql).unwrap();
        conn.pragma_update(None, "user_version", 2).unwrap();
        conn.execute(
            "INSERT INTO atoms (id, content_hash, tenant_id, atomic_value, modality, subtype)
             VALUES ('root', zeroblob(32), 'default', x'00', 'text', 'file'),
                    ('token', randomblob(32), 'default', x'01', 'text', 'token');",
            [],
        )
        .unwrap();

        apply_migrations(&mut conn).unwrap();

        let flagged: Vec<String> = conn
            .prepare("SELECT id FROM atoms WHERE is_embeddable = 1;")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(flagged, vec!["root".to_string()]);
    }
}
