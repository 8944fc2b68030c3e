//! Schema migrations compiled into the binary.
//!
//! Each step is applied at most once, in order, inside its own transaction.
//! Applied step names are recorded in `_geomesh_migrations`.

use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;

const LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS _geomesh_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

/// Ordered schema steps as `(name, sql)`.
const STEPS: &[(&str, &str)] = &[
    ("000_records", include_str!("migrations/000_records.sql")),
    (
        "001_record_indexes",
        include_str!("migrations/001_record_indexes.sql"),
    ),
];

#[derive(Debug, Error)]
pub enum MigrationError {
    /// A step's SQL, or its ledger entry, could not be written.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    /// The ledger could not be read.
    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),
}

/// Brings the schema up to date and returns how many steps were applied.
///
/// # Errors
///
/// Fails on the first step that cannot be applied; earlier steps stay
/// committed.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply_steps(conn, STEPS)
}

fn apply_steps(conn: &Connection, steps: &[(&str, &str)]) -> Result<usize, MigrationError> {
    conn.execute_batch(LEDGER_DDL)
        .map_err(|source| MigrationError::ExecutionFailed {
            name: "ledger".to_string(),
            source,
        })?;

    let mut count = 0;
    for &(name, sql) in steps {
        if is_recorded(conn, name)? {
            tracing::debug!(migration = name, "already applied");
            continue;
        }
        tracing::info!(migration = name, "applying migration");
        apply_one(conn, name, sql).map_err(|source| MigrationError::ExecutionFailed {
            name: name.to_string(),
            source,
        })?;
        count += 1;
    }
    Ok(count)
}

fn is_recorded(conn: &Connection, name: &str) -> Result<bool, MigrationError> {
    conn.query_row(
        "SELECT 1 FROM _geomesh_migrations WHERE name = ?1",
        [name],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
    .map_err(MigrationError::StateQuery)
}

fn apply_one(conn: &Connection, name: &str, sql: &str) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(sql)?;
    tx.execute("INSERT INTO _geomesh_migrations (name) VALUES (?1)", [name])?;
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, table: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table],
            |row| row.get(0),
        )
        .expect("sqlite_master query")
    }

    #[test]
    fn fresh_database_gets_every_step_once() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&conn).unwrap(), STEPS.len());
        assert_eq!(run_migrations(&conn).unwrap(), 0);

        let recorded: usize = conn
            .query_row("SELECT COUNT(*) FROM _geomesh_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(recorded, STEPS.len());
        assert!(table_exists(&conn, "records"));
    }

    #[test]
    fn records_are_unique_per_kind() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let insert = "INSERT INTO records (kind, record_id) VALUES (?1, ?2)";
        conn.execute(insert, ["presence", "u1"]).unwrap();
        assert!(conn.execute(insert, ["presence", "u1"]).is_err());
        conn.execute(insert, ["geofence", "u1"])
            .expect("same id under another kind");
    }

    #[test]
    fn failed_step_leaves_no_partial_schema() {
        let conn = Connection::open_in_memory().unwrap();
        // The step records itself, so the runner's own ledger insert conflicts.
        let steps = [(
            "900_self_recording",
            "CREATE TABLE half_done (id INTEGER PRIMARY KEY);
             INSERT INTO _geomesh_migrations (name) VALUES ('900_self_recording');",
        )];

        match apply_steps(&conn, &steps) {
            Err(MigrationError::ExecutionFailed { name, .. }) => {
                assert_eq!(name, "900_self_recording")
            }
            other => panic!("expected execution failure, got {other:?}"),
        }
        assert!(!table_exists(&conn, "half_done"));
    }
}
