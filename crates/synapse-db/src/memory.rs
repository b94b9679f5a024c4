//! # Memory Row Store
//!
//! `RowStore` kept in process memory. Nothing survives a restart; used when
//! `storage.backend = "memory"` and as a lightweight backend in tests.
//! Follows the same write policy as the SQLite store.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use synapse_core::HubRegistration;

use crate::error::DbResult;
use crate::store::{EntityRow, RowStore, StorageBackend, UpdateOutcome};

#[derive(Debug, Default)]
struct Tables {
    entities: HashMap<String, EntityRow>,
    locals: HashMap<String, HashMap<String, Value>>,
}

/// In-memory row store.
#[derive(Debug)]
pub struct MemoryRowStore {
    tables: Mutex<Tables>,
    application_name: String,
    registration: HubRegistration,
}

impl MemoryRowStore {
    pub fn new(application_name: impl Into<String>, registration: HubRegistration) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            application_name: application_name.into(),
            registration,
        }
    }

    /// Snapshot of one row, for inspection.
    pub async fn row(&self, unique_id: &str) -> Option<EntityRow> {
        self.tables.lock().await.entities.get(unique_id).cloned()
    }

    fn new_row(&self, unique_id: &str, state_json: String) -> EntityRow {
        let now = Utc::now();
        EntityRow {
            unique_id: unique_id.to_string(),
            entity_id: None,
            application_name: self.application_name.clone(),
            state_json,
            first_observed: now,
            last_modified: now,
            last_reported: now,
        }
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn load(&self, unique_id: &str, defaults: &Value) -> DbResult<EntityRow> {
        let state_json = serde_json::to_string(defaults)?;
        let mut tables = self.tables.lock().await;

        let row = tables
            .entities
            .entry(unique_id.to_string())
            .or_insert_with(|| self.new_row(unique_id, state_json));

        Ok(row.clone())
    }

    async fn update(&self, unique_id: &str, content: &Value) -> DbResult<UpdateOutcome> {
        let state_json = serde_json::to_string(content)?;
        let mut tables = self.tables.lock().await;

        if let Some(row) = tables.entities.get_mut(unique_id) {
            let now = Utc::now();
            if row.state_json != state_json {
                row.last_modified = now;
                row.state_json = state_json;
            }
            row.last_reported = now;
            return Ok(UpdateOutcome::Updated);
        }

        if !self.registration.is_registered() {
            warn!(
                unique_id = %unique_id,
                "Skipping write for entity unknown to the hub while app is unregistered"
            );
            return Ok(UpdateOutcome::Skipped);
        }

        let row = self.new_row(unique_id, state_json);
        tables.entities.insert(unique_id.to_string(), row);
        Ok(UpdateOutcome::Inserted)
    }

    async fn set_entity_id(&self, unique_id: &str, entity_id: &str) -> DbResult<()> {
        let mut tables = self.tables.lock().await;
        match tables.entities.get_mut(unique_id) {
            Some(row) => row.entity_id = Some(entity_id.to_string()),
            None => debug!(unique_id = %unique_id, entity_id = %entity_id, "No row to attach entity id to"),
        }
        Ok(())
    }

    async fn load_locals(&self, unique_id: &str) -> DbResult<HashMap<String, Value>> {
        let tables = self.tables.lock().await;
        Ok(tables.locals.get(unique_id).cloned().unwrap_or_default())
    }

    async fn update_local(&self, unique_id: &str, key: &str, value: &Value) -> DbResult<()> {
        let mut tables = self.tables.lock().await;
        tables
            .locals
            .entry(unique_id.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete_local(&self, unique_id: &str, key: &str) -> DbResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(locals) = tables.locals.get_mut(unique_id) {
            locals.remove(key);
        }
        Ok(())
    }

    async fn delete_locals_by_unique_id(&self, unique_id: &str) -> DbResult<u64> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .locals
            .remove(unique_id)
            .map(|locals| locals.len() as u64)
            .unwrap_or(0))
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}
