//! Database migrations
//!
//! Schema: transfer sessions and the tasks journaled under them

use crate::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i32 = 1;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    let result: std::result::Result<i32, _> =
        conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        });

    match result {
        Ok(v) => Ok(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(rusqlite::Error::SqliteFailure(_, _)) => {
            // Table doesn't exist yet
            conn.execute(
                "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
                [],
            )?;
            conn.execute("INSERT INTO schema_version (version) VALUES (0)", [])?;
            Ok(0)
        }
        Err(e) => Err(e.into()),
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    tracing::info!("Running migration v1: transfer journal");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS transfer_sessions (
            identifier TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            invalidated_at TEXT
        );
    "#,
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS transfer_tasks (
            session_identifier TEXT NOT NULL,
            task_id INTEGER NOT NULL,
            url TEXT NOT NULL,
            headers TEXT NOT NULL DEFAULT '{}',
            state TEXT NOT NULL DEFAULT 'suspended',
            bytes_received INTEGER NOT NULL DEFAULT 0,
            partial_path TEXT,
            etag TEXT,
            last_modified TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (session_identifier, task_id),
            FOREIGN KEY (session_identifier)
                REFERENCES transfer_sessions(identifier) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_transfer_tasks_state
            ON transfer_tasks(session_identifier, state);
    "#,
    )?;

    Ok(())
}
