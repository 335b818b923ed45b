//! SQLite adapter: Implementation of `RemoteTable` for local use.
//!
//! Every logical table lives in one `records` table, keyed by table name and
//! row id, with the row itself stored as a JSON document. Filtering and
//! ordering reuse the port's reference semantics, so a query behaves here
//! exactly as it does against the in-memory adapter.
//!
//! # Blocking
//!
//! Calls run on the caller's task while holding the connection lock.
//! This suits a local file accessed by a single process; the hosted backend
//! goes through `RestTables` instead.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode};
use serde_json::Value;

use super::stamp_row;
use crate::ports::{Filter, Query, RemoteTable, Row, TableError};

/// Error type for the SQLite adapter.
#[derive(Debug, thiserror::Error)]
pub enum SqliteTableError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt record {table}/{id}: {reason}")]
    Corrupt {
        table: String,
        id: String,
        reason: String,
    },
}

impl From<SqliteTableError> for TableError {
    fn from(e: SqliteTableError) -> Self {
        let code = match &e {
            SqliteTableError::Database(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                TableError::UNIQUE_VIOLATION
            }
            SqliteTableError::Database(_) => "SQLITE",
            SqliteTableError::Corrupt { .. } => "SQLITE_CORRUPT",
        };
        TableError::new(code, e.to_string())
    }
}

/// SQLite table adapter.
pub struct SqliteTables {
    conn: Mutex<Connection>,
}

impl SqliteTables {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or initialized.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, SqliteTableError> {
        let tables = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        tables.init_schema()?;
        Ok(tables)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    /// Returns error if the database cannot be created.
    pub fn in_memory() -> Result<Self, SqliteTableError> {
        let tables = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        tables.init_schema()?;
        Ok(tables)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), SqliteTableError> {
        self.conn().execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS records (
                tbl TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (tbl, id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_created
                ON records(tbl, created_at);
            ",
        )?;
        Ok(())
    }

    /// Load every row of `table` in insertion order, keyed by stored id.
    fn load(conn: &Connection, table: &str) -> Result<Vec<(String, Row)>, SqliteTableError> {
        let mut stmt = conn
            .prepare("SELECT id, body FROM records WHERE tbl = ?1 ORDER BY created_at, rowid")?;
        let raw = stmt
            .query_map(params![table], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(id, body)| match serde_json::from_str::<Value>(&body) {
                Ok(Value::Object(row)) => Ok((id, row)),
                Ok(other) => Err(SqliteTableError::Corrupt {
                    table: table.to_string(),
                    id,
                    reason: format!("body is a JSON {}", kind(&other)),
                }),
                Err(e) => Err(SqliteTableError::Corrupt {
                    table: table.to_string(),
                    id,
                    reason: e.to_string(),
                }),
            })
            .collect()
    }

    fn select_rows(&self, table: &str, query: &Query) -> Result<Vec<Row>, SqliteTableError> {
        let conn = self.conn();
        let mut rows: Vec<Row> = Self::load(&conn, table)?
            .into_iter()
            .map(|(_, row)| row)
            .collect();
        query.apply(&mut rows);
        Ok(rows)
    }

    fn insert_rows(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, SqliteTableError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut inserted = Vec::with_capacity(rows.len());
        for mut row in rows {
            let id = stamp_row(&mut row);
            let created_at = row
                .get("created_at")
                .and_then(Value::as_str)
                .map_or_else(|| Utc::now().to_rfc3339(), str::to_string);
            tx.execute(
                "INSERT INTO records (tbl, id, body, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![table, id, Value::Object(row.clone()).to_string(), created_at],
            )?;
            inserted.push(row);
        }

        tx.commit()?;
        tracing::debug!(table, count = inserted.len(), "Inserted rows");
        Ok(inserted)
    }

    fn update_rows(
        &self,
        table: &str,
        filters: &[Filter],
        patch: Row,
    ) -> Result<Vec<Row>, SqliteTableError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut updated = Vec::new();
        for (id, mut row) in Self::load(&tx, table)? {
            if !filters.iter().all(|f| f.matches(&row)) {
                continue;
            }
            for (column, value) in &patch {
                row.insert(column.clone(), value.clone());
            }
            tx.execute(
                "UPDATE records SET body = ?3 WHERE tbl = ?1 AND id = ?2",
                params![table, id, Value::Object(row.clone()).to_string()],
            )?;
            updated.push(row);
        }

        tx.commit()?;
        Ok(updated)
    }

    fn delete_rows(&self, table: &str, filters: &[Filter]) -> Result<(), SqliteTableError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let doomed: Vec<String> = Self::load(&tx, table)?
            .into_iter()
            .filter(|(_, row)| filters.iter().all(|f| f.matches(row)))
            .map(|(id, _)| id)
            .collect();
        for id in &doomed {
            tx.execute(
                "DELETE FROM records WHERE tbl = ?1 AND id = ?2",
                params![table, id],
            )?;
        }

        tx.commit()?;
        tracing::debug!(table, count = doomed.len(), "Deleted rows");
        Ok(())
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl RemoteTable for SqliteTables {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, TableError> {
        Ok(self.select_rows(table, query)?)
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, TableError> {
        Ok(self.insert_rows(table, rows)?)
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: Row,
    ) -> Result<Vec<Row>, TableError> {
        Ok(self.update_rows(table, filters, patch)?)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), TableError> {
        Ok(self.delete_rows(table, filters)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::Order;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_crud_cycle() {
        let tables = SqliteTables::in_memory().expect("Should create db");

        let inserted = tables
            .insert(
                "patients",
                vec![
                    row(json!({"first_name": "Mia", "last_name": "Walker"})),
                    row(json!({"first_name": "Anh", "last_name": "Nguyen"})),
                ],
            )
            .await
            .expect("Should insert");
        let id = inserted[0]["id"].as_str().expect("id").to_string();

        let sorted = tables
            .select("patients", &Query::new().order(Order::asc("last_name")))
            .await
            .expect("Should select");
        assert_eq!(sorted[0]["last_name"], "Nguyen");

        let updated = tables
            .update(
                "patients",
                &[Filter::eq("id", id.as_str())],
                row(json!({"last_name": "Walker-Smith"})),
            )
            .await
            .expect("Should update");
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0]["first_name"], "Mia");

        tables
            .delete("patients", &[Filter::eq("id", id.as_str())])
            .await
            .expect("Should delete");
        let left = tables
            .select("patients", &Query::new())
            .await
            .expect("Should select");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0]["first_name"], "Anh");
    }

    #[tokio::test]
    async fn test_tables_are_isolated() {
        let tables = SqliteTables::in_memory().expect("Should create db");
        tables
            .insert("druglist", vec![row(json!({"id": 1, "generic_name": "ibuprofen"}))])
            .await
            .expect("Should insert");
        tables
            .insert("patients", vec![row(json!({"id": 1, "first_name": "Mia"}))])
            .await
            .expect("Same id in another table is fine");

        let drugs = tables
            .select("druglist", &Query::new())
            .await
            .expect("Should select");
        assert_eq!(drugs.len(), 1);
        assert_eq!(drugs[0]["id"], 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_maps_to_unique_violation() {
        let tables = SqliteTables::in_memory().expect("Should create db");
        tables
            .insert("t", vec![row(json!({"id": "a"}))])
            .await
            .expect("Should insert");

        let err = tables
            .insert("t", vec![row(json!({"id": "a"}))])
            .await
            .expect_err("Should reject duplicate");
        assert_eq!(err.code, TableError::UNIQUE_VIOLATION);
    }

    #[test]
    fn test_corrupt_body_is_reported() {
        let tables = SqliteTables::in_memory().expect("Should create db");
        tables
            .conn()
            .execute(
                "INSERT INTO records (tbl, id, body, created_at) VALUES ('t', 'x', '[1]', 'now')",
                [],
            )
            .expect("Should insert raw");

        let err = tables
            .select_rows("t", &Query::new())
            .expect_err("Should fail");
        assert!(matches!(err, SqliteTableError::Corrupt { .. }));
        assert_eq!(TableError::from(err).code, "SQLITE_CORRUPT");
    }
}
