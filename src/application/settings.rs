//! Key/value application settings with a read-through cache.

use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::state::{lock, Status, StoreEvent};
use super::{decode, decode_all, first_row, tables};
use crate::domain::Setting;
use crate::ports::{Filter, Query, RemoteTable, Row};
use crate::Result;

const KEY: &str = "setting_key";
const VALUE: &str = "setting_value";

/// Store for `app_settings`.
pub struct SettingsStore<T: RemoteTable> {
    tables: Arc<T>,
    cache: Mutex<HashMap<String, Value>>,
    status: Status,
}

impl<T: RemoteTable> SettingsStore<T> {
    pub fn new(tables: Arc<T>) -> Self {
        Self {
            tables,
            cache: Mutex::new(HashMap::new()),
            status: Status::default(),
        }
    }

    /// Snapshot of the cached settings.
    #[must_use]
    pub fn settings(&self) -> HashMap<String, Value> {
        lock(&self.cache).clone()
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

    /// Load every setting and replace the cache.
    ///
    /// # Errors
    /// Returns the remote failure or a decode error.
    pub async fn fetch_settings(&self) -> Result<HashMap<String, Value>> {
        self.status
            .track("Failed to fetch settings", self.load_all())
            .await
    }

    /// Cached value for `key`, falling back to a remote lookup.
    ///
    /// A cached `null` or `false` is still a hit.
    ///
    /// # Errors
    /// Returns the remote failure of the fallback lookup.
    pub async fn get_setting(&self, key: &str) -> Result<Option<Value>> {
        let cached = lock(&self.cache).get(key).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        self.status
            .track("Failed to fetch setting", self.lookup(key))
            .await
    }

    /// Update the row for `key`, or insert one if none exists.
    ///
    /// # Errors
    /// Returns the remote failure or a decode error.
    pub async fn save_setting(&self, key: &str, value: Value) -> Result<Setting> {
        self.status
            .track("Failed to save setting", self.upsert(key, value))
            .await
    }

    /// # Errors
    /// Returns the remote failure.
    pub async fn delete_setting(&self, key: &str) -> Result<()> {
        self.status
            .track("Failed to delete setting", self.remove(key))
            .await
    }

    async fn load_all(&self) -> Result<HashMap<String, Value>> {
        let rows = self.tables.select(tables::SETTINGS, &Query::new()).await?;
        let settings: HashMap<String, Value> = decode_all::<Setting>(rows)?
            .into_iter()
            .map(|s| (s.setting_key, s.setting_value))
            .collect();

        *lock(&self.cache) = settings.clone();
        self.status.emit(StoreEvent::CollectionChanged);
        Ok(settings)
    }

    async fn lookup(&self, key: &str) -> Result<Option<Value>> {
        let rows = self.tables.select(tables::SETTINGS, &by_key(key)).await?;
        let Some(row) = rows.into_iter().next() else {
            tracing::debug!(key, "Setting not present");
            return Ok(None);
        };

        let setting: Setting = decode(row)?;
        self.cache_value(key, setting.setting_value.clone());
        Ok(Some(setting.setting_value))
    }

    async fn upsert(&self, key: &str, value: Value) -> Result<Setting> {
        let existing = self.tables.select(tables::SETTINGS, &by_key(key)).await?;

        let rows = if existing.is_empty() {
            let mut row = Row::new();
            row.insert(KEY.to_string(), Value::String(key.to_string()));
            row.insert(VALUE.to_string(), value);
            self.tables.insert(tables::SETTINGS, vec![row]).await?
        } else {
            let mut patch = Row::new();
            patch.insert(VALUE.to_string(), value);
            self.tables
                .update(tables::SETTINGS, &[Filter::eq(KEY, key)], patch)
                .await?
        };

        let setting: Setting = decode(first_row(rows, || format!("setting {key}"))?)?;
        self.cache_value(key, setting.setting_value.clone());
        tracing::info!(key, "Saved setting");
        Ok(setting)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.tables
            .delete(tables::SETTINGS, &[Filter::eq(KEY, key)])
            .await?;
        lock(&self.cache).remove(key);
        self.status.emit(StoreEvent::CollectionChanged);
        Ok(())
    }

    fn cache_value(&self, key: &str, value: Value) {
        lock(&self.cache).insert(key.to_string(), value);
        self.status.emit(StoreEvent::CollectionChanged);
    }
}

fn by_key(key: &str) -> Query {
    Query::new().filter(Filter::eq(KEY, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryTables, TableOp};
    use serde_json::json;

    fn store() -> (Arc<MemoryTables>, SettingsStore<MemoryTables>) {
        let tables = Arc::new(MemoryTables::new());
        let rows = [
            json!({"id": 1, "setting_key": "clinic_name", "setting_value": "Harbour GP"}),
            json!({"id": 2, "setting_key": "show_brand_names", "setting_value": false}),
        ]
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect();
        tables.seed(tables::SETTINGS, rows);
        (Arc::clone(&tables), SettingsStore::new(tables))
    }

    #[tokio::test]
    async fn test_fetch_builds_map() {
        let (_, store) = store();
        let settings = store.fetch_settings().await.expect("fetches");
        assert_eq!(settings["clinic_name"], "Harbour GP");
        assert_eq!(settings["show_brand_names"], false);
    }

    #[tokio::test]
    async fn test_cached_false_is_a_hit() {
        let (tables, store) = store();
        store.fetch_settings().await.expect("fetches");

        let value = store.get_setting("show_brand_names").await.expect("reads");
        assert_eq!(value, Some(json!(false)));
        assert_eq!(tables.calls_of(TableOp::Select, tables::SETTINGS).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_setting_is_none() {
        let (_, store) = store();
        assert_eq!(store.get_setting("nope").await.expect("reads"), None);
        assert!(store.error().is_none());
    }

    #[tokio::test]
    async fn test_save_updates_or_inserts() {
        let (tables, store) = store();

        store
            .save_setting("clinic_name", json!("Bayside GP"))
            .await
            .expect("updates");
        store
            .save_setting("theme", json!("dark"))
            .await
            .expect("inserts");

        assert_eq!(tables.calls_of(TableOp::Update, tables::SETTINGS).len(), 1);
        assert_eq!(tables.calls_of(TableOp::Insert, tables::SETTINGS).len(), 1);
        assert_eq!(tables.rows(tables::SETTINGS).len(), 3);
        assert_eq!(store.settings()["clinic_name"], "Bayside GP");
        assert_eq!(store.get_setting("theme").await.expect("reads"), Some(json!("dark")));
    }

    #[tokio::test]
    async fn test_delete_evicts_cache() {
        let (tables, store) = store();
        store.fetch_settings().await.expect("fetches");
        store.delete_setting("clinic_name").await.expect("deletes");

        assert!(!store.settings().contains_key("clinic_name"));
        assert_eq!(tables.rows(tables::SETTINGS).len(), 1);
    }
}
