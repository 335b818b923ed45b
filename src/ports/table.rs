//! Remote table port: Trait for the hosted row store.
//!
//! This trait abstracts the table service (PostgREST, SQLite, in-memory)
//! from the stores. Rows are plain JSON objects so that malformed records
//! reach the normalizer intact instead of failing at the boundary.

use std::cmp::Ordering;
use std::future::Future;

use serde_json::{Map, Value};

/// A single table row as returned by the backend.
pub type Row = Map<String, Value>;

/// Structured failure reported by a table call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct TableError {
    /// Backend error code (PostgREST code, SQLSTATE or HTTP status)
    pub code: String,

    /// Human-readable message
    pub message: String,
}

impl TableError {
    /// PostgREST code for "no rows where exactly one was expected".
    pub const NOT_FOUND: &'static str = "PGRST116";

    /// SQLSTATE for a unique constraint violation.
    pub const UNIQUE_VIOLATION: &'static str = "23505";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code == Self::NOT_FOUND
    }
}

/// Row predicate understood by every adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Column equals value
    Eq(String, Value),
    /// Column equals any of the values
    In(String, Vec<Value>),
    /// Case-insensitive pattern match, `%` matches any run of characters
    ILike(String, String),
    /// Any of the nested filters matches
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    pub fn is_in<V: Into<Value>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::In(column.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn ilike(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::ILike(column.into(), pattern.into())
    }

    /// `%term%` on a column.
    pub fn contains(column: impl Into<String>, term: &str) -> Self {
        Self::ILike(column.into(), format!("%{term}%"))
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::Or(filters.into_iter().collect())
    }

    /// Evaluate the filter against a row.
    ///
    /// Local adapters use this as the reference semantics. A missing column
    /// never matches.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::Eq(column, expected) => row.get(column).is_some_and(|v| same_value(v, expected)),
            Self::In(column, values) => row
                .get(column)
                .is_some_and(|v| values.iter().any(|expected| same_value(v, expected))),
            Self::ILike(column, pattern) => row
                .get(column)
                .and_then(Value::as_str)
                .is_some_and(|text| ilike(pattern, text)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(row)),
        }
    }
}

/// Equality as a textual filter sees it: a number equals its decimal string.
///
/// `int8` keys come back from storage as numbers but travel through the
/// stores as strings.
fn same_value(stored: &Value, expected: &Value) -> bool {
    match (stored, expected) {
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            n.to_string() == *s
        }
        _ => stored == expected,
    }
}

/// SQL `ILIKE` with `%` wildcards only.
fn ilike(pattern: &str, text: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let text = text.to_lowercase();
    let parts: Vec<&str> = pattern.split('%').collect();

    if parts.len() == 1 {
        return pattern == text;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !text.starts_with(first) {
        return false;
    }

    let mut pos = first.len();
    for part in &parts[1..parts.len() - 1] {
        match text[pos..].find(part) {
            Some(found) => pos += found + part.len(),
            None => return false,
        }
    }

    text.len() - pos >= last.len() && text.ends_with(last)
}

/// Sort order for a select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }

    /// Compare two rows on the order column.
    ///
    /// Missing and null values sort after everything else when ascending,
    /// matching Postgres' default `NULLS LAST`.
    #[must_use]
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        let ordering = compare_values(a.get(&self.column), b.get(&self.column));
        if self.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            Some(Value::Bool(_)) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(Value::Array(_) | Value::Object(_)) => 3,
            Some(Value::Null) | None => 4,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Filters plus optional ordering for a select.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
}

impl Query {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    /// All filters match.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Filter and sort rows in place using the reference semantics.
    pub fn apply(&self, rows: &mut Vec<Row>) {
        rows.retain(|row| self.matches(row));
        if let Some(order) = &self.order {
            rows.sort_by(|a, b| order.compare(a, b));
        }
    }
}

/// Trait for the remote table client.
///
/// Every call is one suspension point. Implementations must not retry on
/// their own beyond what their transport already does.
pub trait RemoteTable: Send + Sync {
    /// Select the rows matching `query`.
    ///
    /// # Errors
    /// Returns the backend's structured error.
    fn select(
        &self,
        table: &str,
        query: &Query,
    ) -> impl Future<Output = Result<Vec<Row>, TableError>> + Send;

    /// Insert rows and return them as stored (with generated columns).
    ///
    /// # Errors
    /// Returns the backend's structured error.
    fn insert(
        &self,
        table: &str,
        rows: Vec<Row>,
    ) -> impl Future<Output = Result<Vec<Row>, TableError>> + Send;

    /// Set the columns in `patch` on every matching row and return the
    /// updated rows.
    ///
    /// # Errors
    /// Returns the backend's structured error.
    fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: Row,
    ) -> impl Future<Output = Result<Vec<Row>, TableError>> + Send;

    /// Delete every matching row.
    ///
    /// # Errors
    /// Returns the backend's structured error.
    fn delete(
        &self,
        table: &str,
        filters: &[Filter],
    ) -> impl Future<Output = Result<(), TableError>> + Send;
}
