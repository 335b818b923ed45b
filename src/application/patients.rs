//! Patient store.

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use super::state::{lock, Status, StoreEvent};
use super::{decode, decode_all, first_row, tables};
use crate::domain::{NewPatient, Patient, PatientSearch};
use crate::ports::{Filter, Order, Query, RemoteTable, Row};
use crate::Result;

#[derive(Debug, Default)]
struct PatientState {
    patients: Vec<Arc<Patient>>,
    current: Option<Arc<Patient>>,
}

/// Store for patient records.
pub struct PatientStore<T: RemoteTable> {
    tables: Arc<T>,
    state: Mutex<PatientState>,
    status: Status,
}

impl<T: RemoteTable> PatientStore<T> {
    pub fn new(tables: Arc<T>) -> Self {
        Self {
            tables,
            state: Mutex::new(PatientState::default()),
            status: Status::default(),
        }
    }

    #[must_use]
    pub fn patients(&self) -> Vec<Arc<Patient>> {
        lock(&self.state).patients.clone()
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<Patient>> {
        lock(&self.state).current.clone()
    }

    #[must_use]
    pub fn loading(&self) -> bool {
        self.status.loading()
    }

    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.status.error()
    }

    pub fn subscribe(&self) -> Receiver<StoreEvent> {
        self.status.subscribe()
    }

    /// Load all patients ordered by last name and make them the list.
    ///
    /// # Errors
    /// Returns the remote failure or a decode error.
    pub async fn fetch_patients(&self) -> Result<Vec<Arc<Patient>>> {
        self.status
            .track("Failed to fetch patients", self.load_list(Query::new()))
            .await
    }

    /// Load one patient and make it current.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id, or the remote failure.
    pub async fn fetch_patient_by_id(&self, patient_id: &str) -> Result<Arc<Patient>> {
        self.status
            .track("Failed to fetch patient", self.load_one(patient_id))
            .await
    }

    /// Search by date of birth, Medicare number or name, depending on the
    /// shape of `term` (see [`PatientSearch::classify`]). Replaces the list.
    ///
    /// # Errors
    /// Returns the remote failure or a decode error.
    pub async fn search_patients(&self, term: &str) -> Result<Vec<Arc<Patient>>> {
        let search = PatientSearch::classify(term);
        tracing::debug!(kind = search.kind(), "Searching patients");
        let query = Query::new().filter(search.to_filter());
        self.status
            .track("Failed to search patients", self.load_list(query))
            .await
    }

    /// Insert a patient, append it to the list and make it current.
    ///
    /// # Errors
    /// Returns the remote failure or a decode error.
    pub async fn create_patient(&self, new: NewPatient) -> Result<Arc<Patient>> {
        self.status
            .track("Failed to create patient", self.insert(new))
            .await
    }

    /// Patch a patient and swap the new record in wherever it is held.
    ///
    /// # Errors
    /// Returns `NotFound` if no row matched, or the remote failure.
    pub async fn update_patient(&self, patient_id: &str, patch: Row) -> Result<Arc<Patient>> {
        self.status
            .track("Failed to update patient", self.patch(patient_id, patch))
            .await
    }

    /// # Errors
    /// Returns the remote failure.
    pub async fn delete_patient(&self, patient_id: &str) -> Result<()> {
        self.status
            .track("Failed to delete patient", self.remove(patient_id))
            .await
    }

    pub fn set_current_patient(&self, patient: Option<Patient>) {
        lock(&self.state).current = patient.map(Arc::new);
        self.status.emit(StoreEvent::CurrentChanged);
    }

    pub fn clear_current_patient(&self) {
        self.set_current_patient(None);
    }

    async fn load_list(&self, query: Query) -> Result<Vec<Arc<Patient>>> {
        let query = query.order(Order::asc("last_name"));
        let rows = self.tables.select(tables::PATIENTS, &query).await?;
        let patients: Vec<Arc<Patient>> = decode_all::<Patient>(rows)?
            .into_iter()
            .map(Arc::new)
            .collect();

        lock(&self.state).patients = patients.clone();
        self.status.emit(StoreEvent::CollectionChanged);
        Ok(patients)
    }

    async fn load_one(&self, patient_id: &str) -> Result<Arc<Patient>> {
        let query = Query::new().filter(Filter::eq("id", patient_id));
        let rows = self.tables.select(tables::PATIENTS, &query).await?;
        let patient = Arc::new(decode::<Patient>(first_row(rows, || {
            format!("patient {patient_id}")
        })?)?);

        lock(&self.state).current = Some(Arc::clone(&patient));
        self.status.emit(StoreEvent::CurrentChanged);
        Ok(patient)
    }

    async fn insert(&self, new: NewPatient) -> Result<Arc<Patient>> {
        let rows = self.tables.insert(tables::PATIENTS, vec![new.to_row()]).await?;
        let patient = Arc::new(decode::<Patient>(first_row(rows, || {
            "inserted patient".to_string()
        })?)?);

        {
            let mut state = lock(&self.state);
            state.patients.push(Arc::clone(&patient));
            state.current = Some(Arc::clone(&patient));
        }
        self.status.emit(StoreEvent::CollectionChanged);
        self.status.emit(StoreEvent::CurrentChanged);

        tracing::info!(patient_id = %patient.id, "Created patient");
        Ok(patient)
    }

    async fn patch(&self, patient_id: &str, patch: Row) -> Result<Arc<Patient>> {
        let rows = self
            .tables
            .update(tables::PATIENTS, &[Filter::eq("id", patient_id)], patch)
            .await?;
        let patient = Arc::new(decode::<Patient>(first_row(rows, || {
            format!("patient {patient_id}")
        })?)?);

        let was_current = {
            let mut state = lock(&self.state);
            if let Some(slot) = state.patients.iter_mut().find(|p| p.id == patient.id) {
                *slot = Arc::clone(&patient);
            }
            match &mut state.current {
                Some(current) if current.id == patient.id => {
                    *current = Arc::clone(&patient);
                    true
                }
                _ => false,
            }
        };
        self.status.emit(StoreEvent::CollectionChanged);
        if was_current {
            self.status.emit(StoreEvent::CurrentChanged);
        }
        Ok(patient)
    }

    async fn remove(&self, patient_id: &str) -> Result<()> {
        self.tables
            .delete(tables::PATIENTS, &[Filter::eq("id", patient_id)])
            .await?;

        let cleared = {
            let mut state = lock(&self.state);
            state.patients.retain(|p| p.id != patient_id);
            let matches = state.current.as_ref().is_some_and(|c| c.id == patient_id);
            if matches {
                state.current = None;
            }
            matches
        };
        self.status.emit(StoreEvent::CollectionChanged);
        if cleared {
            self.status.emit(StoreEvent::CurrentChanged);
        }

        tracing::info!(patient_id, "Deleted patient");
        Ok(())
    }
}
