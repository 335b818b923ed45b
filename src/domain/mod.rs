//! Domain layer: Core record types and the logic that guards them.
//!
//! Pure Rust types with no I/O. The profile normalizer, the merge engine
//! and share-token minting live here so they can be tested without a
//! backend.

pub mod access_link;
mod drug;
pub mod ids;
mod patient;
pub mod profile;
mod setting;

pub use access_link::{AccessLink, LinkStatus, NewAccessLink, DEFAULT_EXPIRY_HOURS};
pub use drug::Drug;
pub use patient::{NewPatient, Patient, PatientSearch};
pub use profile::{
    merge_profile_data, normalize_profile, normalize_profile_row, MergeDepth, NewProfile,
    Normalized, Profile, ProfileData, ProfileUpdate, Repair,
};
pub use setting::Setting;
