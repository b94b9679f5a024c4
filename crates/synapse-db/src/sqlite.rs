//! # SQLite Row Store
//!
//! `RowStore` over the two SQLite tables.
//!
//! ## Load / Update Flow
//! ```text
//!  load(uid, defaults)                 update(uid, content)
//!       │                                   │
//!       ▼                                   ▼
//!  INSERT .. ON CONFLICT DO NOTHING    UPDATE .. WHERE unique_id = uid
//!       │                                   │
//!       ▼                              rows == 0 ?
//!  SELECT row                               ├── hub registered → UPSERT
//!                                           └── otherwise      → skip + warn
//! ```

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use synapse_core::HubRegistration;

use crate::error::{DbError, DbResult};
use crate::pool::Database;
use crate::store::{EntityRow, RowStore, StorageBackend, UpdateOutcome};

/// SQLite-backed row store.
#[derive(Debug, Clone)]
pub struct SqliteRowStore {
    db: Database,
    application_name: String,
    registration: HubRegistration,
}

impl SqliteRowStore {
    pub fn new(db: Database, application_name: impl Into<String>, registration: HubRegistration) -> Self {
        Self {
            db,
            application_name: application_name.into(),
            registration,
        }
    }

    /// Underlying database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Rows previously written by this application.
    pub async fn list_rows(&self) -> DbResult<Vec<EntityRow>> {
        self.db.entities().list_by_application(&self.application_name).await
    }
}

#[async_trait]
impl RowStore for SqliteRowStore {
    async fn load(&self, unique_id: &str, defaults: &Value) -> DbResult<EntityRow> {
        let entities = self.db.entities();
        let state_json = serde_json::to_string(defaults)?;

        entities
            .insert_if_missing(unique_id, &self.application_name, &state_json, Utc::now())
            .await?;

        entities
            .find(unique_id)
            .await?
            .ok_or_else(|| DbError::not_found("HomeAssistantEntity", unique_id))
    }

    async fn update(&self, unique_id: &str, content: &Value) -> DbResult<UpdateOutcome> {
        let entities = self.db.entities();
        let state_json = serde_json::to_string(content)?;
        let now = Utc::now();

        if entities.update_state(unique_id, &state_json, now).await? > 0 {
            return Ok(UpdateOutcome::Updated);
        }

        if !self.registration.is_registered() {
            warn!(
                unique_id = %unique_id,
                "Skipping write for entity unknown to the hub while app is unregistered"
            );
            return Ok(UpdateOutcome::Skipped);
        }

        entities
            .upsert_state(unique_id, &self.application_name, &state_json, now)
            .await?;
        debug!(unique_id = %unique_id, "Created entity row on update");
        Ok(UpdateOutcome::Inserted)
    }

    async fn set_entity_id(&self, unique_id: &str, entity_id: &str) -> DbResult<()> {
        let rows = self.db.entities().set_entity_id(unique_id, entity_id).await?;
        if rows == 0 {
            debug!(unique_id = %unique_id, entity_id = %entity_id, "No row to attach entity id to");
        }
        Ok(())
    }

    async fn load_locals(&self, unique_id: &str) -> DbResult<HashMap<String, Value>> {
        self.db
            .locals()
            .list(unique_id)
            .await?
            .into_iter()
            .map(|row| -> DbResult<(String, Value)> {
                Ok((row.key, serde_json::from_str(&row.value_json)?))
            })
            .collect()
    }

    async fn update_local(&self, unique_id: &str, key: &str, value: &Value) -> DbResult<()> {
        let value_json = serde_json::to_string(value)?;
        self.db
            .locals()
            .upsert(unique_id, key, &value_json, Utc::now())
            .await
    }

    async fn delete_local(&self, unique_id: &str, key: &str) -> DbResult<()> {
        self.db.locals().delete(unique_id, key).await?;
        Ok(())
    }

    async fn delete_locals_by_unique_id(&self, unique_id: &str) -> DbResult<u64> {
        self.db.locals().delete_all(unique_id).await
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Sqlite
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
