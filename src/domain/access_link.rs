//! Share links: time-boxed, token-based access to a single profile.
//!
//! The token is the credential. Whoever holds it can read the profile until
//! the link expires or is revoked, without a session of their own. Both
//! checks happen at read time; nothing is deleted when a link lapses.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids;
use crate::ports::Row;

/// Lifetime of a link when the caller does not choose one.
pub const DEFAULT_EXPIRY_HOURS: i64 = 24;

/// Base-36 digits taken from each random fraction.
const TOKEN_HALF_DIGITS: usize = 13;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Expand the fractional part of `fraction` into `digits` base-36 digits.
///
/// `0.5` becomes `"i000..."`. Only the fraction is used, so callers can
/// pass any float.
#[must_use]
pub fn fraction_to_base36(fraction: f64, digits: usize) -> String {
    let mut x = fraction.fract().abs();
    let mut out = String::with_capacity(digits);

    for _ in 0..digits {
        x *= 36.0;
        let digit = (x.floor() as usize).min(35);
        out.push(char::from(BASE36[digit]));
        x -= digit as f64;
    }

    out
}

/// Mint a fresh share token.
///
/// Two independent uniform fractions from a ChaCha20 CSPRNG, each expanded
/// to 13 lowercase base-36 digits and concatenated.
#[must_use]
pub fn generate_share_token() -> String {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    let mut rng = ChaCha20Rng::from_entropy();
    let first: f64 = rng.gen();
    let second: f64 = rng.gen();

    let mut token = fraction_to_base36(first, TOKEN_HALF_DIGITS);
    token.push_str(&fraction_to_base36(second, TOKEN_HALF_DIGITS));
    token
}

/// Read-time state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Active,
    Expired,
    Revoked,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Expired => write!(f, "expired"),
            Self::Revoked => write!(f, "revoked"),
        }
    }
}

fn active_by_default() -> bool {
    true
}

/// A stored share link.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessLink {
    #[serde(deserialize_with = "ids::string_or_number")]
    pub id: String,

    #[serde(deserialize_with = "ids::string_or_number")]
    pub profile_id: String,

    /// The external credential. Never logged.
    pub unique_hash: String,

    pub expiry_time: DateTime<Utc>,

    #[serde(default = "active_by_default")]
    pub is_active: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AccessLink {
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> LinkStatus {
        if !self.is_active {
            LinkStatus::Revoked
        } else if now >= self.expiry_time {
            LinkStatus::Expired
        } else {
            LinkStatus::Active
        }
    }

    #[must_use]
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.status_at(now) == LinkStatus::Active
    }
}

// The token is a bearer credential; keep it out of debug output.
impl std::fmt::Debug for AccessLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLink")
            .field("id", &self.id)
            .field("profile_id", &self.profile_id)
            .field("unique_hash", &"[redacted]")
            .field("expiry_time", &self.expiry_time)
            .field("is_active", &self.is_active)
            .finish()
    }
}

/// Insert payload for a new link.
#[derive(Clone, PartialEq)]
pub struct NewAccessLink {
    pub profile_id: String,
    pub unique_hash: String,
    pub expiry_time: DateTime<Utc>,
    pub is_active: bool,
}

impl NewAccessLink {
    /// Issue a link with a freshly minted token, valid for `expiry_hours`
    /// from `issued_at`.
    ///
    /// # Errors
    /// Returns an error if `expiry_hours` is not positive or overflows the
    /// timestamp range.
    pub fn issue(
        profile_id: impl Into<String>,
        issued_at: DateTime<Utc>,
        expiry_hours: i64,
    ) -> Result<Self, String> {
        Self::with_token(profile_id, generate_share_token(), issued_at, expiry_hours)
    }

    /// Same as [`issue`](Self::issue) with a caller-supplied token.
    ///
    /// # Errors
    /// Returns an error if `expiry_hours` is not positive or overflows the
    /// timestamp range.
    pub fn with_token(
        profile_id: impl Into<String>,
        unique_hash: impl Into<String>,
        issued_at: DateTime<Utc>,
        expiry_hours: i64,
    ) -> Result<Self, String> {
        if expiry_hours <= 0 {
            return Err(format!("expiry must be at least one hour, got {expiry_hours}"));
        }
        let lifetime = Duration::try_hours(expiry_hours)
            .ok_or_else(|| format!("expiry of {expiry_hours} hours is out of range"))?;
        let expiry_time = issued_at
            .checked_add_signed(lifetime)
            .ok_or_else(|| format!("expiry of {expiry_hours} hours is out of range"))?;

        Ok(Self {
            profile_id: profile_id.into(),
            unique_hash: unique_hash.into(),
            expiry_time,
            is_active: true,
        })
    }

    #[must_use]
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("profile_id".to_string(), Value::String(self.profile_id.clone()));
        row.insert("unique_hash".to_string(), Value::String(self.unique_hash.clone()));
        row.insert(
            "expiry_time".to_string(),
            Value::String(self.expiry_time.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        row.insert("is_active".to_string(), Value::Bool(self.is_active));
        row
    }
}

impl std::fmt::Debug for NewAccessLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewAccessLink")
            .field("profile_id", &self.profile_id)
            .field("unique_hash", &"[redacted]")
            .field("expiry_time", &self.expiry_time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn test_fraction_expansion() {
        assert_eq!(fraction_to_base36(0.5, 4), "i000");
        assert_eq!(fraction_to_base36(0.0, 3), "000");
        assert_eq!(fraction_to_base36(1.25, 2), "90");
    }

    #[test]
    fn test_token_shape() {
        let a = generate_share_token();
        let b = generate_share_token();

        assert_eq!(a.len(), 2 * TOKEN_HALF_DIGITS);
        assert!(a.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_expiry_is_exact() {
        let issued = at("2026-03-01T10:15:30Z");
        let link = NewAccessLink::issue("p1", issued, DEFAULT_EXPIRY_HOURS).expect("issues");

        assert_eq!(link.expiry_time, at("2026-03-02T10:15:30Z"));
        assert_eq!(link.expiry_time - issued, Duration::hours(24));
        assert!(link.is_active);
        assert_eq!(link.to_row()["expiry_time"], "2026-03-02T10:15:30.000Z");
    }

    #[test]
    fn test_rejects_bad_expiry() {
        let issued = at("2026-03-01T10:15:30Z");
        assert!(NewAccessLink::issue("p1", issued, 0).is_err());
        assert!(NewAccessLink::issue("p1", issued, -5).is_err());
        assert!(NewAccessLink::issue("p1", issued, i64::MAX).is_err());
    }

    #[test]
    fn test_status_is_read_time() {
        let link: AccessLink = serde_json::from_value(json!({
            "id": 3,
            "profile_id": "p1",
            "unique_hash": "abc",
            "expiry_time": "2026-03-02T10:15:30.000+00:00"
        }))
        .expect("decodes");

        assert!(link.is_active);
        assert_eq!(link.status_at(at("2026-03-02T10:15:29Z")), LinkStatus::Active);
        assert_eq!(link.status_at(at("2026-03-02T10:15:30Z")), LinkStatus::Expired);

        let revoked = AccessLink {
            is_active: false,
            ..link
        };
        assert_eq!(revoked.status_at(at("2026-03-01T00:00:00Z")), LinkStatus::Revoked);
    }

    #[test]
    fn test_debug_hides_token() {
        let issued_at = at("2026-03-01T00:00:00Z");
        let link =
            NewAccessLink::with_token("p1", "supersecrettoken", issued_at, 1).expect("issues");
        assert!(!format!("{link:?}").contains("supersecrettoken"));
    }
}
