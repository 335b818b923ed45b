//! Application settings stored as key/value rows.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids;

/// A row of `app_settings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    #[serde(default, deserialize_with = "ids::opt_string_or_number")]
    pub id: Option<String>,

    pub setting_key: String,

    #[serde(default)]
    pub setting_value: Value,
}
