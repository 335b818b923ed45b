//! Environment-driven configuration.
//!
//! | Variable | Default |
//! |---|---|
//! | `MEDPROFILE_BACKEND` | `sqlite` (or `rest`) |
//! | `MEDPROFILE_DB_PATH` | `data/medprofile.db` |
//! | `MEDPROFILE_REST_URL` | required for `rest` |
//! | `MEDPROFILE_LINK_EXPIRY_HOURS` | `24` |
//! | `MEDPROFILE_LOG_MODE` | `auto` (`file`, `stdout`) |
//! | `MEDPROFILE_LOG_FILE` | `data/medprofile.log` |
//!
//! The REST API key is read, in order, from the file named by
//! `MEDPROFILE_API_KEY_FILE`, the Docker secret
//! `/run/secrets/medprofile_api_key`, or (debug builds only) the
//! `MEDPROFILE_API_KEY` variable. Release builds refuse secrets in the
//! environment.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::domain::DEFAULT_EXPIRY_HOURS;
use crate::{MedProfileError, Result};

const BACKEND_ENV: &str = "MEDPROFILE_BACKEND";
const DB_PATH_ENV: &str = "MEDPROFILE_DB_PATH";
const REST_URL_ENV: &str = "MEDPROFILE_REST_URL";
const LINK_EXPIRY_ENV: &str = "MEDPROFILE_LINK_EXPIRY_HOURS";
const LOG_MODE_ENV: &str = "MEDPROFILE_LOG_MODE";
const LOG_FILE_ENV: &str = "MEDPROFILE_LOG_FILE";

const API_KEY_FILE_ENV: &str = "MEDPROFILE_API_KEY_FILE";
const API_KEY_DOCKER_SECRET_PATH: &str = "/run/secrets/medprofile_api_key";
// Dev-only escape hatch for local runs and tests.
const API_KEY_ENV_DEV: &str = "MEDPROFILE_API_KEY";

const DEFAULT_DB_PATH: &str = "data/medprofile.db";
const DEFAULT_LOG_FILE: &str = "data/medprofile.log";

/// Where rows are stored.
#[derive(Clone, PartialEq, Eq)]
pub enum Backend {
    Sqlite { path: PathBuf },
    Rest { url: String, api_key: String },
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite { path } => f.debug_struct("Sqlite").field("path", path).finish(),
            Self::Rest { url, .. } => f
                .debug_struct("Rest")
                .field("url", url)
                .field("api_key", &"<redacted>")
                .finish(),
        }
    }
}

/// Log sink selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// File when stdout is a terminal, stdout otherwise
    Auto,
    File,
    Stdout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub mode: LogMode,
    pub file: PathBuf,
}

impl LogConfig {
    /// Whether to log to the file, given whether stdout is a terminal.
    #[must_use]
    pub fn use_file(&self, interactive: bool) -> bool {
        match self.mode {
            LogMode::File => true,
            LogMode::Stdout => false,
            LogMode::Auto => interactive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub backend: Backend,
    pub link_expiry_hours: i64,
    pub log: LogConfig,
    /// Fallbacks taken while reading the environment. Configuration is read
    /// before logging is installed, so the caller logs these afterwards.
    pub warnings: Vec<String>,
}

impl Config {
    /// Emit the collected fallback warnings through `tracing`.
    pub fn log_warnings(&self) {
        for warning in &self.warnings {
            tracing::warn!("{warning}");
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    ///
    /// # Errors
    /// Returns `Config` when the REST backend is selected without a URL or
    /// an API key.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Read configuration through `var`, which maps a variable name to its
    /// value.
    ///
    /// # Errors
    /// See [`Config::from_env`].
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let value = |name: &str| var(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut warnings = Vec::new();

        let log = LogConfig {
            mode: match value(LOG_MODE_ENV).as_deref() {
                None | Some("auto") => LogMode::Auto,
                Some("file") => LogMode::File,
                Some("stdout") => LogMode::Stdout,
                Some(other) => {
                    warnings.push(format!("Unknown {LOG_MODE_ENV} '{other}', using auto"));
                    LogMode::Auto
                }
            },
            file: value(LOG_FILE_ENV)
                .map_or_else(|| PathBuf::from(DEFAULT_LOG_FILE), PathBuf::from),
        };

        let link_expiry_hours = match value(LINK_EXPIRY_ENV) {
            None => DEFAULT_EXPIRY_HOURS,
            Some(raw) => match raw.parse::<i64>() {
                Ok(hours) if hours > 0 => hours,
                _ => {
                    warnings.push(format!(
                        "Invalid {LINK_EXPIRY_ENV} '{raw}', using {DEFAULT_EXPIRY_HOURS}"
                    ));
                    DEFAULT_EXPIRY_HOURS
                }
            },
        };

        let backend = match value(BACKEND_ENV).as_deref() {
            Some("rest") => {
                let url = value(REST_URL_ENV).ok_or_else(|| {
                    MedProfileError::Config(format!(
                        "{REST_URL_ENV} is required for the rest backend"
                    ))
                })?;
                let api_key = read_api_key(&value)?;
                Backend::Rest { url, api_key }
            }
            other => {
                if let Some(other) = other.filter(|b| *b != "sqlite") {
                    warnings.push(format!("Unknown {BACKEND_ENV} '{other}', using sqlite"));
                }
                Backend::Sqlite {
                    path: value(DB_PATH_ENV)
                        .map_or_else(|| PathBuf::from(DEFAULT_DB_PATH), PathBuf::from),
                }
            }
        };

        Ok(Self {
            backend,
            link_expiry_hours,
            log,
            warnings,
        })
    }
}

/// Read the API key from the first configured secure source.
fn read_api_key(value: &impl Fn(&str) -> Option<String>) -> Result<String> {
    // 1) Explicit file path
    if let Some(path) = value(API_KEY_FILE_ENV) {
        return read_secret_file(Path::new(&path));
    }

    // 2) Docker secrets default path
    let docker = Path::new(API_KEY_DOCKER_SECRET_PATH);
    if docker.exists() {
        return read_secret_file(docker);
    }

    // 3) Dev-only env var (refused in release builds)
    if cfg!(debug_assertions) {
        if let Some(key) = value(API_KEY_ENV_DEV) {
            return Ok(key);
        }
    }

    Err(MedProfileError::Config(format!(
        "Missing API key: provide {API_KEY_FILE_ENV} (or mount {API_KEY_DOCKER_SECRET_PATH})"
    )))
}

fn read_secret_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)?;
    let secret = content.trim_end_matches(['\n', '\r']).to_string();
    if secret.is_empty() {
        return Err(MedProfileError::Config(format!(
            "API key file {} is empty",
            path.display()
        )));
    }
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(vars(&[])).expect("Should load");
        assert_eq!(
            config.backend,
            Backend::Sqlite {
                path: PathBuf::from(DEFAULT_DB_PATH)
            }
        );
        assert_eq!(config.link_expiry_hours, 24);
        assert_eq!(config.log.mode, LogMode::Auto);
        assert!(config.log.use_file(true));
        assert!(!config.log.use_file(false));
        assert!(config.warnings.is_empty());
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = Config::from_vars(vars(&[
            (LINK_EXPIRY_ENV, "-3"),
            (LOG_MODE_ENV, "syslog"),
            (BACKEND_ENV, "mongo"),
        ]))
        .expect("Should load");
        assert_eq!(config.link_expiry_hours, DEFAULT_EXPIRY_HOURS);
        assert_eq!(config.log.mode, LogMode::Auto);
        assert!(matches!(config.backend, Backend::Sqlite { .. }));
        assert_eq!(
            config.warnings,
            [
                "Unknown MEDPROFILE_LOG_MODE 'syslog', using auto",
                "Invalid MEDPROFILE_LINK_EXPIRY_HOURS '-3', using 24",
                "Unknown MEDPROFILE_BACKEND 'mongo', using sqlite",
            ]
        );
    }

    #[test]
    fn test_rest_reads_key_file() {
        let mut file = tempfile::NamedTempFile::new().expect("Should create file");
        writeln!(file, "sb_secret_abc").expect("Should write");
        let path = file.path().to_string_lossy().to_string();

        let config = Config::from_vars(vars(&[
            (BACKEND_ENV, "rest"),
            (REST_URL_ENV, "https://db.example.org"),
            (API_KEY_FILE_ENV, &path),
            (LINK_EXPIRY_ENV, "48"),
        ]))
        .expect("Should load");

        assert_eq!(
            config.backend,
            Backend::Rest {
                url: "https://db.example.org".to_string(),
                api_key: "sb_secret_abc".to_string()
            }
        );
        assert_eq!(config.link_expiry_hours, 48);
        assert!(!format!("{config:?}").contains("sb_secret_abc"));
    }

    #[test]
    fn test_rest_requires_url() {
        let err = Config::from_vars(vars(&[(BACKEND_ENV, "rest")])).expect_err("Should fail");
        assert!(matches!(err, MedProfileError::Config(_)));
    }

    #[test]
    fn test_dev_key_from_env_in_debug_builds() {
        let result = Config::from_vars(vars(&[
            (BACKEND_ENV, "rest"),
            (REST_URL_ENV, "http://localhost:54321"),
            (API_KEY_ENV_DEV, "dev-key"),
        ]));
        if cfg!(debug_assertions) && !Path::new(API_KEY_DOCKER_SECRET_PATH).exists() {
            let config = result.expect("Should load");
            assert!(matches!(
                config.backend,
                Backend::Rest { ref api_key, .. } if api_key == "dev-key"
            ));
        }
    }
}
