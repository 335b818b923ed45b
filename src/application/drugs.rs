//! Drug catalogue store.

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use super::state::{lock, Status, StoreEvent};
use super::{decode_all, tables};
use crate::domain::Drug;
use crate::ports::{Filter, Order, Query, RemoteTable};
use crate::Result;

#[derive(Debug, Default)]
struct Catalog {
    drugs: Vec<Drug>,
    common: Vec<Drug>,
}

/// Read-only view of the shared drug list.
pub struct DrugCatalog<T: RemoteTable> {
    tables: Arc<T>,
    state: Mutex<Catalog>,
    status: Status,
}

impl<T: RemoteTable> DrugCatalog<T> {
    pub fn new(tables: Arc<T>) -> Self {
        Self {
            tables,
            state: Mutex::new(Catalog::default()),
            status: Status::default(),
        }
    }

    #[must_use]
    pub fn drugs(&self) -> Vec<Drug> {
        lock(&self.state).drugs.clone()
    }

    #[must_use]
    pub fn common_drugs(&self) -> Vec<Drug> {
        lock(&self.state).common.clone()
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

    /// Load every drug, ordered by generic name.
    ///
    /// # Errors
    /// Returns the remote failure or a decode error.
    pub async fn fetch_drugs(&self) -> Result<Vec<Drug>> {
        self.status
            .track("Failed to fetch drugs", self.load(Query::new(), false))
            .await
    }

    /// Load the quick-pick list.
    ///
    /// # Errors
    /// Returns the remote failure or a decode error.
    pub async fn fetch_common_drugs(&self) -> Result<Vec<Drug>> {
        let query = Query::new().filter(Filter::eq("common_drug", true));
        self.status
            .track("Failed to fetch common drugs", self.load(query, true))
            .await
    }

    /// Match the term against generic and brand names. Results are not cached.
    ///
    /// # Errors
    /// Returns the remote failure or a decode error.
    pub async fn search_drugs(&self, term: &str) -> Result<Vec<Drug>> {
        let filter = Filter::or([
            Filter::contains("generic_name", term),
            Filter::contains("brand_name", term),
        ]);
        self.status
            .track("Failed to search drugs", self.select(Query::new().filter(filter)))
            .await
    }

    /// Post-login load: the full list, then the common list.
    ///
    /// # Errors
    /// Returns the first failure; the common list is not fetched after it.
    pub async fn preload(&self) -> Result<()> {
        let drugs = self.fetch_drugs().await?;
        let common = self.fetch_common_drugs().await?;
        tracing::info!(drugs = drugs.len(), common = common.len(), "Drug catalogue loaded");
        Ok(())
    }

    async fn load(&self, query: Query, common: bool) -> Result<Vec<Drug>> {
        let drugs = self.select(query).await?;
        {
            let mut state = lock(&self.state);
            if common {
                state.common = drugs.clone();
            } else {
                state.drugs = drugs.clone();
            }
        }
        self.status.emit(StoreEvent::CollectionChanged);
        Ok(drugs)
    }

    async fn select(&self, query: Query) -> Result<Vec<Drug>> {
        let query = query.order(Order::asc("generic_name"));
        let rows = self.tables.select(tables::DRUGS, &query).await?;
        decode_all(rows)
    }
}
