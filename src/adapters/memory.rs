//! In-memory adapter: Implementation of `RemoteTable` for tests and demos.
//!
//! Rows live in a `HashMap` behind a `Mutex`. Every call is appended to a
//! log so callers can assert exactly which writes happened, and failures can
//! be queued per operation and table.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::stamp_row;
use crate::ports::{Filter, Query, RemoteTable, Row, TableError};

/// Kind of table call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableOp {
    Select,
    Insert,
    Update,
    Delete,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct TableCall {
    pub op: TableOp,
    pub table: String,
    pub filters: Vec<Filter>,
    /// Inserted rows, or the single patch of an update
    pub payload: Vec<Row>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, Vec<Row>>,
    calls: Vec<TableCall>,
    failures: HashMap<(TableOp, String), VecDeque<TableError>>,
}

/// In-process table store.
#[derive(Debug, Default)]
pub struct MemoryTables {
    inner: Mutex<Inner>,
}

impl MemoryTables {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append rows exactly as given, bypassing id and timestamp generation.
    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        self.inner()
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Current contents of a table.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner().tables.get(table).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<TableCall> {
        self.inner().calls.clone()
    }

    /// Calls of one kind against one table, oldest first.
    #[must_use]
    pub fn calls_of(&self, op: TableOp, table: &str) -> Vec<TableCall> {
        self.inner()
            .calls
            .iter()
            .filter(|c| c.op == op && c.table == table)
            .cloned()
            .collect()
    }

    /// Make the next `op` on `table` fail with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, op: TableOp, table: &str, error: TableError) {
        self.inner()
            .failures
            .entry((op, table.to_string()))
            .or_default()
            .push_back(error);
    }

    /// Log the call and pop a queued failure for it, if any.
    fn record(
        inner: &mut Inner,
        op: TableOp,
        table: &str,
        filters: &[Filter],
        payload: Vec<Row>,
    ) -> Result<(), TableError> {
        inner.calls.push(TableCall {
            op,
            table: table.to_string(),
            filters: filters.to_vec(),
            payload,
        });

        match inner
            .failures
            .get_mut(&(op, table.to_string()))
            .and_then(VecDeque::pop_front)
        {
            Some(error) => {
                tracing::debug!(?op, table, code = %error.code, "Injected table failure");
                Err(error)
            }
            None => Ok(()),
        }
    }
}

impl RemoteTable for MemoryTables {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, TableError> {
        let mut inner = self.inner();
        Self::record(&mut inner, TableOp::Select, table, &query.filters, Vec::new())?;

        let mut rows = inner.tables.get(table).cloned().unwrap_or_default();
        query.apply(&mut rows);
        Ok(rows)
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, TableError> {
        let mut inner = self.inner();
        Self::record(&mut inner, TableOp::Insert, table, &[], rows.clone())?;

        let stored = inner.tables.entry(table.to_string()).or_default();
        let mut inserted = Vec::with_capacity(rows.len());
        for mut row in rows {
            let id = stamp_row(&mut row);
            let taken = stored.iter().any(|existing| match existing.get("id") {
                Some(serde_json::Value::String(s)) => *s == id,
                Some(serde_json::Value::Number(n)) => n.to_string() == id,
                _ => false,
            });
            if taken {
                return Err(TableError::new(
                    TableError::UNIQUE_VIOLATION,
                    format!("duplicate key value violates unique constraint on {table}.id"),
                ));
            }
            inserted.push(row);
        }

        stored.extend(inserted.iter().cloned());
        Ok(inserted)
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: Row,
    ) -> Result<Vec<Row>, TableError> {
        let mut inner = self.inner();
        Self::record(&mut inner, TableOp::Update, table, filters, vec![patch.clone()])?;

        let mut updated = Vec::new();
        if let Some(rows) = inner.tables.get_mut(table) {
            for row in rows
                .iter_mut()
                .filter(|row| filters.iter().all(|f| f.matches(row)))
            {
                for (column, value) in &patch {
                    row.insert(column.clone(), value.clone());
                }
                updated.push(row.clone());
            }
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), TableError> {
        let mut inner = self.inner();
        Self::record(&mut inner, TableOp::Delete, table, filters, Vec::new())?;

        if let Some(rows) = inner.tables.get_mut(table) {
            rows.retain(|row| !filters.iter().all(|f| f.matches(row)));
        }
        Ok(())
    }
}
