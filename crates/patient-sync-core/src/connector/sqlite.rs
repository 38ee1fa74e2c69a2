//! SQLite-backed connector.

use std::path::PathBuf;

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, ToSql};
use tracing::{debug, warn};

use super::{looks_like_lock_conflict, Connector, ConnectorError, ConnectorResult, QueryResult, SqlValue};

impl From<rusqlite::Error> for ConnectorError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                ConnectorError::LockConflict(e.to_string())
            }
            _ if looks_like_lock_conflict(&e.to_string()) => ConnectorError::LockConflict(e.to_string()),
            _ => ConnectorError::Query(e.to_string()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Date(d) => ToSqlOutput::Owned(Value::Text(d.format("%Y-%m-%d").to_string())),
        })
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Integer(i) => SqlValue::Integer(i),
            Value::Real(f) => SqlValue::Real(f),
            Value::Text(s) => SqlValue::Text(s),
            Value::Blob(b) => SqlValue::Text(String::from_utf8_lossy(&b).into_owned()),
        }
    }
}

/// Where the database lives.
#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// Connector over a SQLite database file (or an in-memory database).
pub struct SqliteConnector {
    location: Location,
    conn: Option<Connection>,
}

impl SqliteConnector {
    /// Connector for a database file, created if missing.
    pub fn open<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            location: Location::File(path.into()),
            conn: None,
        }
    }

    /// Private in-memory database (for testing).
    ///
    /// The database lives as long as the connection; `disconnect` discards it.
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            conn: None,
        }
    }

    fn conn(&self) -> ConnectorResult<&Connection> {
        self.conn.as_ref().ok_or(ConnectorError::NotConnected)
    }
}

impl Connector for SqliteConnector {
    fn connect(&mut self) -> bool {
        if self.conn.is_some() {
            return true;
        }
        let opened = match &self.location {
            Location::File(path) => Connection::open(path),
            Location::Memory => Connection::open_in_memory(),
        };
        match opened {
            Ok(conn) => {
                debug!(location = ?self.location, "SQLite connection opened");
                self.conn = Some(conn);
                true
            }
            Err(e) => {
                warn!(location = ?self.location, error = %e, "SQLite connection failed");
                false
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "Error closing SQLite connection");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn execute(&mut self, query: &str, params: &[SqlValue]) -> ConnectorResult<Option<QueryResult>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(query)?;

        if stmt.column_count() == 0 {
            stmt.execute(params_from_iter(params.iter()))?;
            return Ok(None);
        }

        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|c| c.to_lowercase())
            .collect();
        let width = columns.len();

        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                let value: Value = row.get(i)?;
                values.push(SqlValue::from(value));
            }
            out.push(values);
        }

        Ok(Some(QueryResult { columns, rows: out }))
    }

    fn commit(&mut self) -> ConnectorResult<()> {
        let conn = self.conn()?;
        if !conn.is_autocommit() {
            conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> SqliteConnector {
        let mut c = SqliteConnector::in_memory();
        assert!(c.connect());
        c
    }

    #[test]
    fn test_execute_without_connect() {
        let mut c = SqliteConnector::in_memory();
        assert!(matches!(c.execute("SELECT 1", &[]), Err(ConnectorError::NotConnected)));
    }

    #[test]
    fn test_non_row_statement_returns_none() {
        let mut c = connected();
        let res = c.execute("CREATE TABLE t (id INTEGER, Name TEXT)", &[]).unwrap();
        assert!(res.is_none());
        let res = c
            .execute("INSERT INTO t VALUES (?1, ?2)", &[SqlValue::Integer(1), "x".into()])
            .unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn test_select_lowercases_columns() {
        let mut c = connected();
        c.execute("CREATE TABLE t (ID INTEGER, Name TEXT)", &[]).unwrap();
        c.execute("INSERT INTO t VALUES (1, 'a'), (2, NULL)", &[]).unwrap();

        let res = c
            .execute("SELECT ID, Name FROM t WHERE ID >= ? ORDER BY ID", &[SqlValue::Integer(1)])
            .unwrap()
            .unwrap();
        assert_eq!(res.columns, vec!["id", "name"]);
        assert_eq!(res.rows.len(), 2);
        assert_eq!(res.rows[1][1], SqlValue::Null);
    }

    #[test]
    fn test_commit_in_autocommit_mode_is_noop() {
        let mut c = connected();
        assert!(c.commit().is_ok());
        c.execute("BEGIN", &[]).unwrap();
        assert!(c.commit().is_ok());
    }
}
