//! Drug catalogue entries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids;

/// A row of the shared drug list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drug {
    #[serde(deserialize_with = "ids::string_or_number")]
    pub id: String,

    pub generic_name: String,

    #[serde(default)]
    pub brand_name: Option<String>,

    /// Shown in the quick-pick list
    #[serde(default)]
    pub common_drug: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Drug {
    /// Medication entry seeded from this drug, ready to append to a profile.
    #[must_use]
    pub fn to_medication(&self) -> Value {
        let mut entry = Map::new();
        entry.insert("drug_id".to_string(), Value::String(self.id.clone()));
        entry.insert(
            "generic_name".to_string(),
            Value::String(self.generic_name.clone()),
        );
        if let Some(brand) = &self.brand_name {
            entry.insert("brand_name".to_string(), Value::String(brand.clone()));
        }
        Value::Object(entry)
    }
}
