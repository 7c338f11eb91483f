use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, TransactionBehavior};

use super::{Migration, SchemaStore, RECORD_TABLE};
use crate::error::{DeployError, Result};

/// Migration record kept in a SQLite database file.
///
/// SQLite serializes writers, so `BEGIN IMMEDIATE` around the
/// check-and-append is the lock; `lock`/`unlock` keep their no-op defaults.
pub struct SqliteStore {
    conn: Connection,
}

fn store_err(e: rusqlite::Error) -> DeployError {
    DeployError::MigrationStore(e.to_string())
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        conn.busy_timeout(Duration::from_secs(30)).map_err(store_err)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {RECORD_TABLE} (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                id         TEXT NOT NULL UNIQUE,
                applied_at TEXT NOT NULL
            );"
        ))
        .map_err(store_err)?;
        Ok(Self { conn })
    }
}

impl SchemaStore for SqliteStore {
    fn applied(&mut self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {RECORD_TABLE} ORDER BY seq"))
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(store_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)
    }

    fn apply(&mut self, migration: &Migration) -> Result<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_err)?;

        let recorded: i64 = tx
            .query_row(
                &format!("SELECT COUNT(*) FROM {RECORD_TABLE} WHERE id = ?1"),
                [&migration.id],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        if recorded > 0 {
            tx.commit().map_err(store_err)?;
            return Ok(false);
        }

        // Dropping `tx` on error rolls the partial change back.
        tx.execute_batch(&migration.sql)
            .map_err(|e| DeployError::Migration {
                id: migration.id.clone(),
                reason: e.to_string(),
            })?;
        tx.execute(
            &format!("INSERT INTO {RECORD_TABLE} (id, applied_at) VALUES (?1, ?2)"),
            params![migration.id, chrono::Utc::now().to_rfc3339()],
        )
        .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(true)
    }
}
