//! # medprofile
//!
//! Patient medication profiles over a hosted table service.
//!
//! This crate provides:
//! - A profile normalizer that repairs malformed medication lists and writes
//!   the fix back to storage
//! - A merge engine for partial `profile_data` updates
//! - Expiring, token-based share links for profiles
//! - Plain CRUD stores for patients, the drug list and app settings
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture:
//! - `domain`: Record types, normalization, merging, token minting
//! - `ports`: Trait definitions for the table service and the clock
//! - `adapters`: Concrete implementations (PostgREST, SQLite, in-memory, log redaction)
//! - `application`: Stores orchestrating domain logic over the ports
//! - `config`: Environment-driven configuration

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

pub use application::{DrugCatalog, PatientStore, ProfileStore, SettingsStore, StoreEvent};
pub use domain::{AccessLink, Profile, ProfileData, ProfileUpdate};
pub use ports::{RemoteTable, TableError};

/// Result type for medprofile operations
pub type Result<T> = std::result::Result<T, MedProfileError>;

/// Main error type for medprofile
#[derive(Debug, thiserror::Error)]
pub enum MedProfileError {
    #[error("Remote table call failed: {0}")]
    Remote(#[from] TableError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Share link is {0}")]
    LinkUnavailable(domain::LinkStatus),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MedProfileError {
    /// Message suitable for showing to the user, if the error carries one.
    ///
    /// Backend errors contribute their own message; an empty one yields
    /// `None` so the caller can fall back to a generic text.
    #[must_use]
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::Remote(e) if e.message.trim().is_empty() => None,
            Self::Remote(e) => Some(e.message.clone()),
            other => Some(other.to_string()),
        }
    }
}
