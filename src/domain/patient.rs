//! Patient records and search-term classification.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids;
use crate::ports::{Filter, Row};

/// A patient row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    #[serde(deserialize_with = "ids::string_or_number")]
    pub id: String,

    #[serde(default)]
    pub first_name: String,

    #[serde(default)]
    pub last_name: String,

    /// `YYYY-MM-DD`
    #[serde(default)]
    pub date_of_birth: Option<String>,

    #[serde(default)]
    pub medicare_number: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Patient {
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }
}

/// Insert payload for a new patient.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewPatient {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: Option<String>,
    pub medicare_number: Option<String>,
    pub extra: Map<String, Value>,
}

impl NewPatient {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn born(mut self, date_of_birth: impl Into<String>) -> Self {
        self.date_of_birth = Some(date_of_birth.into());
        self
    }

    #[must_use]
    pub fn medicare(mut self, number: impl Into<String>) -> Self {
        self.medicare_number = Some(number.into());
        self
    }

    #[must_use]
    pub fn to_row(&self) -> Row {
        let mut row = self.extra.clone();
        row.insert("first_name".to_string(), Value::String(self.first_name.clone()));
        row.insert("last_name".to_string(), Value::String(self.last_name.clone()));
        if let Some(dob) = &self.date_of_birth {
            row.insert("date_of_birth".to_string(), Value::String(dob.clone()));
        }
        if let Some(number) = &self.medicare_number {
            row.insert("medicare_number".to_string(), Value::String(number.clone()));
        }
        row
    }
}

fn date_pattern() -> &'static Regex {
    static DATE: OnceLock<Regex> = OnceLock::new();
    DATE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("Valid regex"))
}

fn digits_pattern() -> &'static Regex {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    DIGITS.get_or_init(|| Regex::new(r"^\d+$").expect("Valid regex"))
}

/// How a free-text search term is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatientSearch {
    /// `YYYY-MM-DD`: exact date of birth
    DateOfBirth(String),
    /// All digits: partial Medicare number
    MedicareNumber(String),
    /// Anything else: partial first or last name
    Name(String),
}

impl PatientSearch {
    #[must_use]
    pub fn classify(term: &str) -> Self {
        let term = term.trim();
        if date_pattern().is_match(term) {
            Self::DateOfBirth(term.to_string())
        } else if digits_pattern().is_match(term) {
            Self::MedicareNumber(term.to_string())
        } else {
            Self::Name(term.to_string())
        }
    }

    /// Label for logs. Never includes the term itself.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DateOfBirth(_) => "date_of_birth",
            Self::MedicareNumber(_) => "medicare_number",
            Self::Name(_) => "name",
        }
    }

    #[must_use]
    pub fn to_filter(&self) -> Filter {
        match self {
            Self::DateOfBirth(date) => Filter::eq("date_of_birth", date.as_str()),
            Self::MedicareNumber(digits) => Filter::contains("medicare_number", digits),
            Self::Name(name) => Filter::or([
                Filter::contains("first_name", name),
                Filter::contains("last_name", name),
            ]),
        }
    }
}
