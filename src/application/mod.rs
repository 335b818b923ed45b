//! Application layer: Stores over the remote tables.
//!
//! Each store orchestrates domain logic with the `RemoteTable` port and
//! keeps the last loaded state for its callers. Stores are plain values;
//! construct one per backend and share it behind an `Arc`.

mod drugs;
mod patients;
mod profiles;
mod settings;
mod state;

use serde::de::DeserializeOwned;
use serde_json::Value;

pub use drugs::DrugCatalog;
pub use patients::PatientStore;
pub use profiles::ProfileStore;
pub use settings::SettingsStore;
pub use state::StoreEvent;

use crate::ports::Row;
use crate::{MedProfileError, Result};

/// Table names on the hosted backend.
pub mod tables {
    pub const PROFILES: &str = "patient_profiles";
    pub const ACCESS_LINKS: &str = "profile_access_links";
    pub const PATIENTS: &str = "patients";
    pub const DRUGS: &str = "druglist";
    pub const SETTINGS: &str = "app_settings";
}

fn decode<T: DeserializeOwned>(row: Row) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

fn decode_all<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>> {
    rows.into_iter().map(decode).collect()
}

/// First row of a result, or `NotFound` naming `what`.
fn first_row(rows: Vec<Row>, what: impl FnOnce() -> String) -> Result<Row> {
    rows.into_iter()
        .next()
        .ok_or_else(|| MedProfileError::NotFound(what()))
}
