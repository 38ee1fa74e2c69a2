//! Consolidated store schema.

/// Statements creating the target schema, executed one at a time.
pub const TARGET_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS patients (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hisnumber TEXT NOT NULL,
        source INTEGER NOT NULL CHECK (source IN (1, 2)),
        businessunit INTEGER NOT NULL CHECK (businessunit IN (1, 2, 3)),
        lastname TEXT,
        name TEXT,
        surname TEXT,
        birthdate TEXT,                               -- ISO YYYY-MM-DD
        documenttype INTEGER NOT NULL CHECK (documenttype BETWEEN 1 AND 17),
        document_number TEXT,                         -- digits only
        email TEXT,
        telephone TEXT,
        his_password TEXT,
        login_email TEXT,
        uuid TEXT,                                    -- assigned by downstream matching
        record_hash TEXT NOT NULL,                    -- SHA-256 of the stored content
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE (hisnumber, source)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_patients_source ON patients(source)",
    "CREATE INDEX IF NOT EXISTS idx_patients_uuid ON patients(uuid)",
];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_valid() {
        let conn = Connection::open_in_memory().unwrap();
        for stmt in TARGET_SCHEMA {
            conn.execute_batch(stmt).unwrap();
        }
        // idempotent
        for stmt in TARGET_SCHEMA {
            conn.execute_batch(stmt).unwrap();
        }
    }

    #[test]
    fn test_unique_key_and_checks() {
        let conn = Connection::open_in_memory().unwrap();
        for stmt in TARGET_SCHEMA {
            conn.execute_batch(stmt).unwrap();
        }
        let insert = "INSERT INTO patients (hisnumber, source, businessunit, documenttype, record_hash) VALUES (?, ?, ?, ?, 'h')";

        assert!(conn.execute(insert, rusqlite::params!["1", 2, 1, 17]).is_ok());
        assert!(conn.execute(insert, rusqlite::params!["1", 2, 1, 17]).is_err());
        assert!(conn.execute(insert, rusqlite::params!["1", 1, 1, 17]).is_ok());
        assert!(conn.execute(insert, rusqlite::params!["2", 3, 1, 17]).is_err());
        assert!(conn.execute(insert, rusqlite::params!["3", 1, 1, 18]).is_err());
    }
}
