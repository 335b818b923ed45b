//! Profile records and their medication list.
//!
//! A profile is one medical record view for a patient. Its `profile_data`
//! column is free-form JSON with exactly one required key, `medications`.
//! Everything here works on raw rows first so that records written by other
//! clients (or by hand in the dashboard) can be repaired instead of rejected.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::access_link::AccessLink;
use super::ids;
use crate::ports::Row;

/// Column holding the nested profile document.
pub const PROFILE_DATA: &str = "profile_data";

/// Required key inside `profile_data`.
pub const MEDICATIONS: &str = "medications";

/// The nested profile document.
///
/// `medications` is always a list once a value of this type exists. Entries
/// are open-ended attribute maps (drug name, dose, frequency, ...) and are
/// kept as raw JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileData {
    #[serde(default)]
    pub medications: Vec<Value>,

    /// Sibling keys (notes, allergies, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProfileData {
    /// Build from a medication list with no sibling keys.
    #[must_use]
    pub fn with_medications(medications: Vec<Value>) -> Self {
        Self {
            medications,
            extra: Map::new(),
        }
    }

    /// JSON object form, as persisted.
    #[must_use]
    pub fn to_object(&self) -> Map<String, Value> {
        let mut object = self.extra.clone();
        object.insert(
            MEDICATIONS.to_string(),
            Value::Array(self.medications.clone()),
        );
        object
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.to_object())
    }
}

/// A patient profile as held in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(deserialize_with = "ids::string_or_number")]
    pub id: String,

    #[serde(default, deserialize_with = "ids::opt_string_or_number")]
    pub patient_id: Option<String>,

    pub profile_data: ProfileData,

    /// The link currently offered for sharing, if any
    #[serde(default, deserialize_with = "ids::opt_string_or_number")]
    pub viewable_link_id: Option<String>,

    /// Every link ever issued for this profile (attached by the store)
    #[serde(
        rename = "profile_access_links",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub access_links: Vec<AccessLink>,

    /// Remaining columns (`created_at`, `name`, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Profile {
    /// The access link referenced by `viewable_link_id`, if it was attached.
    #[must_use]
    pub fn viewable_link(&self) -> Option<&AccessLink> {
        let id = self.viewable_link_id.as_deref()?;
        self.access_links.iter().find(|link| link.id == id)
    }
}

/// What the normalizer had to fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// `profile_data` was missing, null or not an object
    InitializedProfileData,
    /// `medications` was missing or null
    InitializedMedications,
    /// `medications` held something other than a list and was discarded
    DiscardedMalformedMedications,
}

impl std::fmt::Display for Repair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InitializedProfileData => write!(f, "initialized profile_data"),
            Self::InitializedMedications => write!(f, "initialized medications"),
            Self::DiscardedMalformedMedications => write!(f, "discarded malformed medications"),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Restore the medication-list invariant on a raw profile row in place.
///
/// Returns `None` when the row was already well-formed. Sibling keys under
/// `profile_data` are never touched.
pub fn normalize_profile_row(row: &mut Row) -> Option<Repair> {
    let profile_id = match row.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let data = row.entry(PROFILE_DATA).or_insert(Value::Null);

    let object = match data {
        Value::Object(object) => object,
        other => {
            if other.is_null() {
                tracing::debug!(
                    profile_id = %profile_id,
                    "Profile has no profile_data, initializing it"
                );
            } else {
                tracing::warn!(
                    profile_id = %profile_id,
                    kind = json_kind(other),
                    "profile_data is not an object, replacing it"
                );
            }
            *other = ProfileData::default().to_value();
            return Some(Repair::InitializedProfileData);
        }
    };

    match object.get(MEDICATIONS) {
        Some(Value::Array(_)) => None,
        None | Some(Value::Null) => {
            tracing::debug!(
                profile_id = %profile_id,
                "Profile has no medications list, initializing it"
            );
            object.insert(MEDICATIONS.to_string(), Value::Array(Vec::new()));
            Some(Repair::InitializedMedications)
        }
        Some(other) => {
            tracing::warn!(
                profile_id = %profile_id,
                kind = json_kind(other),
                "Profile medications is not a list, discarding it"
            );
            object.insert(MEDICATIONS.to_string(), Value::Array(Vec::new()));
            Some(Repair::DiscardedMalformedMedications)
        }
    }
}

/// A profile that passed through the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub profile: Profile,

    /// Set when the stored row violated the invariant and must be written back
    pub repair: Option<Repair>,
}

/// Normalize a raw row and decode it.
///
/// # Errors
/// Returns a serialization error if the row lacks an `id` or a known column
/// has the wrong type.
pub fn normalize_profile(mut row: Row) -> Result<Normalized, serde_json::Error> {
    let repair = normalize_profile_row(&mut row);
    let profile = serde_json::from_value(Value::Object(row))?;
    Ok(Normalized { profile, repair })
}

/// How far a `profile_data` patch descends into the existing document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeDepth {
    /// Keys directly under `profile_data` are replaced wholesale.
    #[default]
    Shallow,
    /// Nested objects are merged key by key. Lists and scalars are replaced.
    Recursive,
}

/// Merge a partial `profile_data` over the existing document.
///
/// Keys missing from `patch` are kept. A missing or null `medications` in
/// the patch leaves the existing list in place, so the result always has
/// one.
#[must_use]
pub fn merge_profile_data(
    existing: &ProfileData,
    patch: &Map<String, Value>,
    depth: MergeDepth,
) -> ProfileData {
    let mut merged = existing.to_object();

    for (key, value) in patch {
        if key == MEDICATIONS && value.is_null() {
            continue;
        }
        if depth == MergeDepth::Recursive {
            if let (Some(Value::Object(target)), Value::Object(source)) =
                (merged.get_mut(key), value)
            {
                merge_objects(target, source);
                continue;
            }
        }
        merged.insert(key.clone(), value.clone());
    }

    let medications = match merged.remove(MEDICATIONS) {
        Some(Value::Array(items)) => items,
        _ => existing.medications.clone(),
    };

    ProfileData {
        medications,
        extra: merged,
    }
}

fn merge_objects(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        if let (Some(Value::Object(inner)), Value::Object(nested)) = (target.get_mut(key), value) {
            merge_objects(inner, nested);
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}

/// Partial update for a profile row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileUpdate {
    /// Partial `profile_data`, merged over the current document when one is loaded
    pub profile_data: Option<Map<String, Value>>,

    /// Other top-level columns, written as given
    pub fields: Row,
}

impl ProfileUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_profile_data(mut self, data: Map<String, Value>) -> Self {
        self.profile_data = Some(data);
        self
    }

    #[must_use]
    pub fn with_field(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }

    /// Split a raw JSON patch into `profile_data` and top-level columns.
    ///
    /// A non-object `profile_data` stays in `fields`, where `validate`
    /// rejects it.
    #[must_use]
    pub fn from_row(mut row: Row) -> Self {
        let profile_data = match row.remove(PROFILE_DATA) {
            Some(Value::Object(data)) => Some(data),
            Some(Value::Null) | None => None,
            Some(other) => {
                row.insert(PROFILE_DATA.to_string(), other);
                None
            }
        };
        Self {
            profile_data,
            fields: row,
        }
    }

    /// Reject updates that could break the profile invariants.
    ///
    /// # Errors
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.fields.contains_key("id") {
            return Err("profile id cannot be changed".to_string());
        }
        if let Some(value) = self.fields.get(PROFILE_DATA) {
            return Err(format!(
                "profile_data must be given as a partial document, got a plain {} column",
                json_kind(value)
            ));
        }
        if let Some(medications) = self.profile_data.as_ref().and_then(|d| d.get(MEDICATIONS)) {
            if !medications.is_null() && !medications.is_array() {
                return Err(format!(
                    "medications must be a list, got {}",
                    json_kind(medications)
                ));
            }
        }
        Ok(())
    }
}

/// Insert payload for a new profile.
///
/// `profile_data` is sent as given, even when absent; the store repairs the
/// stored row afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewProfile {
    pub patient_id: String,
    pub profile_data: Option<Value>,
    pub extra: Map<String, Value>,
}

impl NewProfile {
    pub fn for_patient(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_medications(mut self, medications: Vec<Value>) -> Self {
        self.profile_data = Some(ProfileData::with_medications(medications).to_value());
        self
    }

    #[must_use]
    pub fn with_field(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(column.into(), value.into());
        self
    }

    #[must_use]
    pub fn to_row(&self) -> Row {
        let mut row = self.extra.clone();
        row.insert("patient_id".to_string(), Value::String(self.patient_id.clone()));
        if let Some(data) = &self.profile_data {
            row.insert(PROFILE_DATA.to_string(), data.clone());
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn data(value: Value) -> ProfileData {
        serde_json::from_value(value).expect("valid profile_data")
    }

    #[test]
    fn test_missing_profile_data_is_initialized() {
        let mut row = object(json!({"id": "p1", "patient_id": "pt1"}));
        assert_eq!(normalize_profile_row(&mut row), Some(Repair::InitializedProfileData));
        assert_eq!(row[PROFILE_DATA], json!({"medications": []}));
    }

    #[test]
    fn test_null_and_non_object_profile_data() {
        let mut row = object(json!({"id": "p1", "profile_data": null}));
        assert_eq!(normalize_profile_row(&mut row), Some(Repair::InitializedProfileData));

        let mut row = object(json!({"id": "p1", "profile_data": "garbage"}));
        assert_eq!(normalize_profile_row(&mut row), Some(Repair::InitializedProfileData));
        assert_eq!(row[PROFILE_DATA], json!({"medications": []}));
    }

    #[test]
    fn test_missing_medications_keeps_siblings() {
        let mut row = object(json!({"id": "p1", "profile_data": {"notes": "x"}}));
        assert_eq!(normalize_profile_row(&mut row), Some(Repair::InitializedMedications));
        assert_eq!(row[PROFILE_DATA], json!({"medications": [], "notes": "x"}));
    }

    #[test]
    fn test_non_list_medications_are_discarded() {
        for bad in [json!("oops"), json!(7), json!({"a": 1}), json!(false)] {
            let mut row = object(json!({
                "id": "p1",
                "profile_data": {"medications": bad, "notes": "x"}
            }));
            assert_eq!(
                normalize_profile_row(&mut row),
                Some(Repair::DiscardedMalformedMedications)
            );
            assert_eq!(row[PROFILE_DATA], json!({"medications": [], "notes": "x"}));
        }
    }

    #[test]
    fn test_valid_list_preserved_unchanged() {
        let meds = json!([{"drug": "metformin", "dose": "500mg"}, "free text entry"]);
        let mut row = object(json!({"id": "p1", "profile_data": {"medications": meds.clone()}}));
        assert_eq!(normalize_profile_row(&mut row), None);
        assert_eq!(row[PROFILE_DATA][MEDICATIONS], meds);
    }

    #[test]
    fn test_normalizer_is_idempotent() {
        let inputs = [
            json!({"id": "p1"}),
            json!({"id": "p1", "profile_data": {"notes": "x"}}),
            json!({"id": "p1", "profile_data": {"medications": "oops", "k": [1]}}),
            json!({"id": "p1", "profile_data": {"medications": [{"drug": "a"}]}}),
        ];
        for input in inputs {
            let once = normalize_profile(object(input)).expect("decodes").profile;
            let before = serde_json::to_vec(&once.profile_data).expect("serializes");

            let again = normalize_profile(object(serde_json::to_value(&once).expect("serializes")))
                .expect("decodes");
            assert_eq!(again.repair, None);
            let after = serde_json::to_vec(&again.profile.profile_data).expect("serializes");
            assert_eq!(before, after);
        }
    }

    #[test]
    fn test_normalize_decodes_numeric_ids() {
        let normalized = normalize_profile(object(json!({
            "id": 12,
            "patient_id": 7,
            "viewable_link_id": null,
            "created_at": "2026-01-01T00:00:00Z"
        })))
        .expect("decodes");
        assert_eq!(normalized.profile.id, "12");
        assert_eq!(normalized.profile.patient_id.as_deref(), Some("7"));
        assert_eq!(normalized.profile.extra["created_at"], "2026-01-01T00:00:00Z");
    }

    #[test]
    fn test_merge_preserves_siblings() {
        let existing = data(json!({"medications": ["A"], "notes": "x"}));
        let patch = object(json!({"medications": ["A", "B"]}));
        let merged = merge_profile_data(&existing, &patch, MergeDepth::Shallow);
        assert_eq!(merged.to_value(), json!({"medications": ["A", "B"], "notes": "x"}));
    }

    #[test]
    fn test_merge_never_drops_medications() {
        let existing = data(json!({"medications": ["A"], "notes": "x"}));

        let merged =
            merge_profile_data(&existing, &object(json!({"notes": "y"})), MergeDepth::Shallow);
        assert_eq!(merged.to_value(), json!({"medications": ["A"], "notes": "y"}));

        let merged = merge_profile_data(
            &existing,
            &object(json!({"medications": null})),
            MergeDepth::Shallow,
        );
        assert_eq!(merged.medications, vec![json!("A")]);
    }

    #[test]
    fn test_merge_depth_controls_nested_objects() {
        let existing = data(json!({
            "medications": [],
            "allergies": {"penicillin": "severe", "latex": "mild"}
        }));
        let patch = object(json!({"allergies": {"latex": "none"}}));

        let shallow = merge_profile_data(&existing, &patch, MergeDepth::Shallow);
        assert_eq!(shallow.extra["allergies"], json!({"latex": "none"}));

        let deep = merge_profile_data(&existing, &patch, MergeDepth::Recursive);
        assert_eq!(
            deep.extra["allergies"],
            json!({"penicillin": "severe", "latex": "none"})
        );
    }

    #[test]
    fn test_recursive_merge_replaces_lists() {
        let existing = data(json!({"medications": ["A", "B"]}));
        let merged = merge_profile_data(
            &existing,
            &object(json!({"medications": ["C"]})),
            MergeDepth::Recursive,
        );
        assert_eq!(merged.medications, vec![json!("C")]);
    }

    #[test]
    fn test_update_validation() {
        assert!(ProfileUpdate::new().with_field("name", "Repeat scripts").validate().is_ok());
        assert!(ProfileUpdate::new().with_field("id", "other").validate().is_err());
        assert!(ProfileUpdate::new()
            .with_profile_data(object(json!({"medications": "oops"})))
            .validate()
            .is_err());
        assert!(ProfileUpdate::new()
            .with_profile_data(object(json!({"medications": null})))
            .validate()
            .is_ok());
        assert!(ProfileUpdate::from_row(object(json!({"profile_data": 3})))
            .validate()
            .is_err());
    }

    #[test]
    fn test_update_from_row_splits_profile_data() {
        let update = ProfileUpdate::from_row(object(json!({
            "name": "n",
            "profile_data": {"notes": "x"}
        })));
        assert_eq!(update.profile_data, Some(object(json!({"notes": "x"}))));
        assert_eq!(update.fields, object(json!({"name": "n"})));
    }

    #[test]
    fn test_new_profile_row() {
        let row = NewProfile::for_patient("pt1").to_row();
        assert_eq!(Value::Object(row), json!({"patient_id": "pt1"}));

        let row = NewProfile::for_patient("pt1")
            .with_medications(vec![json!({"drug": "a"})])
            .to_row();
        assert_eq!(row[PROFILE_DATA], json!({"medications": [{"drug": "a"}]}));
    }
}
