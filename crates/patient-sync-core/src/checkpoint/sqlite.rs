//! Checkpoints in a SQLite `sync_state` table.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use super::{CheckpointResult, StateStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Key/value checkpoint table in its own SQLite database.
pub struct SqliteStateStore {
    conn: Connection,
}

impl SqliteStateStore {
    /// Open database at path, creating if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> CheckpointResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Create in-memory database (for testing).
    pub fn open_in_memory() -> CheckpointResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }
}

impl StateStore for SqliteStateStore {
    fn get(&self, key: &str) -> CheckpointResult<Option<String>> {
        self.conn
            .query_row("SELECT value FROM sync_state WHERE key = ?", [key], |row| row.get(0))
            .optional()
            .map_err(Into::into)
    }

    fn set(&mut self, key: &str, value: &str) -> CheckpointResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_state (key, value, updated_at) VALUES (?, ?, datetime('now'))",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> CheckpointResult<()> {
        self.conn.execute("DELETE FROM sync_state WHERE key = ?", [key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_state() {
        let mut store = SqliteStateStore::open_in_memory().unwrap();
        assert_eq!(store.get("snapshot_last_sync_time").unwrap(), None);

        store.set("snapshot_last_sync_time", "2024-01-15T10:00:00Z").unwrap();
        assert_eq!(
            store.get("snapshot_last_sync_time").unwrap(),
            Some("2024-01-15T10:00:00Z".to_string())
        );

        store.remove("snapshot_last_sync_time").unwrap();
        assert_eq!(store.get("snapshot_last_sync_time").unwrap(), None);
    }
}
