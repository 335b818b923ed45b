//! Command-line surface: one subcommand per store operation, JSON on stdout.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use medprofile::config::Config;
use medprofile::domain::{NewPatient, NewProfile, Patient, Profile, ProfileUpdate};
use medprofile::{DrugCatalog, PatientStore, ProfileStore, RemoteTable, SettingsStore};

#[derive(Debug, Parser)]
#[command(name = "medprofile", version, about = "Patient medication profiles")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Medication profiles and share links
    #[command(subcommand)]
    Profile(ProfileCommand),

    /// Patient records
    #[command(subcommand)]
    Patients(PatientsCommand),

    /// Drug catalogue
    #[command(subcommand)]
    Drugs(DrugsCommand),

    /// Application settings
    #[command(subcommand)]
    Settings(SettingsCommand),
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    /// Load a profile (repairing it in storage if needed)
    Show { id: String },
    /// List a patient's profiles, newest first
    List { patient_id: String },
    /// Create an empty profile for a patient
    Create { patient_id: String },
    /// Apply a JSON patch; `profile_data` is merged into the stored document
    Update { id: String, patch: String },
    Delete { id: String },
    /// Issue a share link
    Share {
        id: String,
        /// Link lifetime in hours (defaults to MEDPROFILE_LINK_EXPIRY_HOURS)
        #[arg(long)]
        hours: Option<i64>,
    },
    /// Revoke a share link by its id
    Revoke { link_id: String },
    /// Resolve a share token
    Open { token: String },
}

#[derive(Debug, Subcommand)]
pub enum PatientsCommand {
    List,
    /// Search by date of birth (YYYY-MM-DD), Medicare number or name
    Search { term: String },
    Show { id: String },
    Create {
        first_name: String,
        last_name: String,
        #[arg(long)]
        dob: Option<String>,
        #[arg(long)]
        medicare: Option<String>,
    },
    Delete { id: String },
}

#[derive(Debug, Subcommand)]
pub enum DrugsCommand {
    List,
    Common,
    Search { term: String },
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    List,
    Get { key: String },
    /// Store a value; it is parsed as JSON when possible, else kept as text
    Set { key: String, value: String },
    Delete { key: String },
}

/// Parse a command-line value as JSON, falling back to a plain string.
fn json_or_text(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Run one command against `tables` and return what to print.
pub async fn run<T: RemoteTable>(
    tables: Arc<T>,
    command: Command,
    config: &Config,
) -> Result<Value> {
    match command {
        Command::Profile(command) => {
            let store = ProfileStore::new(tables).with_link_expiry_hours(config.link_expiry_hours);
            run_profile(&store, command).await
        }
        Command::Patients(command) => run_patients(&PatientStore::new(tables), command).await,
        Command::Drugs(command) => run_drugs(&DrugCatalog::new(tables), command).await,
        Command::Settings(command) => run_settings(&SettingsStore::new(tables), command).await,
    }
}

async fn run_profile<T: RemoteTable>(
    store: &ProfileStore<T>,
    command: ProfileCommand,
) -> Result<Value> {
    let value = match command {
        ProfileCommand::Show { id } => {
            serde_json::to_value(&*store.fetch_profile_by_id(&id).await?)?
        }
        ProfileCommand::List { patient_id } => {
            let profiles = store.fetch_patient_profiles(&patient_id).await?;
            serde_json::to_value(profiles.iter().map(|p| &**p).collect::<Vec<&Profile>>())?
        }
        ProfileCommand::Create { patient_id } => {
            let created = store.create_profile(NewProfile::for_patient(patient_id)).await?;
            serde_json::to_value(&*created)?
        }
        ProfileCommand::Update { id, patch } => {
            let parsed = serde_json::from_str::<Value>(&patch).context("patch must be JSON")?;
            let Value::Object(row) = parsed else {
                bail!("patch must be a JSON object");
            };
            // Load first so profile_data merges over the stored document.
            store.fetch_profile_by_id(&id).await?;
            match store.update_profile(&id, ProfileUpdate::from_row(row)).await? {
                Some(updated) => serde_json::to_value(&*updated)?,
                None => Value::Null,
            }
        }
        ProfileCommand::Delete { id } => {
            store.delete_profile(&id).await?;
            json!({ "deleted": id })
        }
        ProfileCommand::Share { id, hours } => {
            serde_json::to_value(store.create_profile_link(&id, hours).await?)?
        }
        ProfileCommand::Revoke { link_id } => {
            serde_json::to_value(store.revoke_profile_link(&link_id).await?)?
        }
        ProfileCommand::Open { token } => {
            serde_json::to_value(&*store.open_shared_profile(&token).await?)?
        }
    };
    Ok(value)
}

async fn run_patients<T: RemoteTable>(
    store: &PatientStore<T>,
    command: PatientsCommand,
) -> Result<Value> {
    let value = match command {
        PatientsCommand::List => {
            let patients = store.fetch_patients().await?;
            serde_json::to_value(patients.iter().map(|p| &**p).collect::<Vec<&Patient>>())?
        }
        PatientsCommand::Search { term } => {
            let patients = store.search_patients(&term).await?;
            serde_json::to_value(patients.iter().map(|p| &**p).collect::<Vec<&Patient>>())?
        }
        PatientsCommand::Show { id } => {
            serde_json::to_value(&*store.fetch_patient_by_id(&id).await?)?
        }
        PatientsCommand::Create {
            first_name,
            last_name,
            dob,
            medicare,
        } => {
            let mut new = NewPatient::new(first_name, last_name);
            if let Some(dob) = dob {
                new = new.born(dob);
            }
            if let Some(medicare) = medicare {
                new = new.medicare(medicare);
            }
            serde_json::to_value(&*store.create_patient(new).await?)?
        }
        PatientsCommand::Delete { id } => {
            store.delete_patient(&id).await?;
            json!({ "deleted": id })
        }
    };
    Ok(value)
}

async fn run_drugs<T: RemoteTable>(
    catalog: &DrugCatalog<T>,
    command: DrugsCommand,
) -> Result<Value> {
    let drugs = match command {
        DrugsCommand::List => catalog.fetch_drugs().await?,
        DrugsCommand::Common => catalog.fetch_common_drugs().await?,
        DrugsCommand::Search { term } => catalog.search_drugs(&term).await?,
    };
    Ok(serde_json::to_value(drugs)?)
}

async fn run_settings<T: RemoteTable>(
    store: &SettingsStore<T>,
    command: SettingsCommand,
) -> Result<Value> {
    let value = match command {
        SettingsCommand::List => serde_json::to_value(store.fetch_settings().await?)?,
        SettingsCommand::Get { key } => store.get_setting(&key).await?.unwrap_or(Value::Null),
        SettingsCommand::Set { key, value } => {
            let saved = store.save_setting(&key, json_or_text(&value)).await?;
            serde_json::to_value(saved)?
        }
        SettingsCommand::Delete { key } => {
            store.delete_setting(&key).await?;
            json!({ "deleted": key })
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use medprofile::adapters::MemoryTables;
    use medprofile::config::{Backend, LogConfig, LogMode};

    fn config() -> Config {
        Config {
            backend: Backend::Sqlite {
                path: "unused.db".into(),
            },
            link_expiry_hours: 24,
            log: LogConfig {
                mode: LogMode::Stdout,
                file: "unused.log".into(),
            },
            warnings: Vec::new(),
        }
    }

    #[test]
    fn test_parse_share_with_hours() {
        let cli = Cli::try_parse_from(["medprofile", "profile", "share", "p1", "--hours", "6"])
            .expect("Should parse");
        assert!(matches!(
            cli.command,
            Command::Profile(ProfileCommand::Share { ref id, hours: Some(6) }) if id == "p1"
        ));
    }

    #[test]
    fn test_json_or_text() {
        assert_eq!(json_or_text("true"), Value::Bool(true));
        assert_eq!(json_or_text("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(json_or_text("Harbour GP"), json!("Harbour GP"));
    }

    #[tokio::test]
    async fn test_settings_round_trip_through_commands() {
        let tables = Arc::new(MemoryTables::new());
        let config = config();

        run(
            Arc::clone(&tables),
            Command::Settings(SettingsCommand::Set {
                key: "theme".to_string(),
                value: "dark".to_string(),
            }),
            &config,
        )
        .await
        .expect("Should set");

        let value = run(
            tables,
            Command::Settings(SettingsCommand::Get {
                key: "theme".to_string(),
            }),
            &config,
        )
        .await
        .expect("Should get");
        assert_eq!(value, json!("dark"));
    }

    #[tokio::test]
    async fn test_profile_update_rejects_non_object_patch() {
        let err = run(
            Arc::new(MemoryTables::new()),
            Command::Profile(ProfileCommand::Update {
                id: "p1".to_string(),
                patch: "[1,2]".to_string(),
            }),
            &config(),
        )
        .await
        .expect_err("Should fail");
        assert!(err.to_string().contains("JSON object"));
    }
}
