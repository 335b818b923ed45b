//! Adapters layer: Concrete implementations of ports.
//!
//! These modules contain the actual integration with external libraries:
//! - `rest`: reqwest client for a PostgREST endpoint
//! - `sqlite`: SQLite for local storage
//! - `memory`: in-process tables with a call log, for tests and demos
//! - `sanitize`: PII filtering for logs

pub mod memory;
pub mod rest;
pub mod sanitize;
pub mod sqlite;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::domain::ids::uuid_v4;
use crate::ports::Row;

pub use memory::MemoryTables;
pub use rest::RestTables;
pub use sqlite::SqliteTables;

/// Fill the columns a hosted table would generate on insert.
///
/// Returns the row's id as a string.
pub(crate) fn stamp_row(row: &mut Row) -> String {
    let id = match row.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            let id = uuid_v4();
            row.insert("id".to_string(), Value::String(id.clone()));
            id
        }
    };

    row.entry("created_at").or_insert_with(|| {
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
    });
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_keeps_given_id() {
        let mut row = Row::new();
        row.insert("id".to_string(), Value::from(12));
        assert_eq!(stamp_row(&mut row), "12");
        assert!(row["created_at"].is_string());
    }

    #[test]
    fn test_stamp_generates_uuid() {
        let mut row = Row::new();
        let id = stamp_row(&mut row);
        assert_eq!(id.len(), 36);
        assert_eq!(row["id"], Value::String(id));
    }
}
