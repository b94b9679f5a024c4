//! # Row Store
//!
//! The one storage interface the rest of Synapse talks to.
//!
//! ## Backends
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         dyn RowStore                                    │
//! │                                                                         │
//! │   storage.backend = "sqlite"          storage.backend = "memory"       │
//! │   ┌──────────────────────────┐        ┌──────────────────────────┐     │
//! │   │ SqliteRowStore           │        │ MemoryRowStore           │     │
//! │   │  Database + repositories │        │  HashMaps behind a Mutex │     │
//! │   │  survives restarts       │        │  process lifetime only   │     │
//! │   └──────────────────────────┘        └──────────────────────────┘     │
//! │                                                                         │
//! │   Selected once by `open_row_store` at startup.                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Write Policy
//! `update` rewrites the full snapshot of a known row. For a row that does
//! not exist yet it only creates one when the hub has accepted this app;
//! otherwise the write is logged and skipped so no orphaned rows appear.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use synapse_core::HubRegistration;

use crate::error::{DbError, DbResult};
use crate::memory::MemoryRowStore;
use crate::pool::{Database, DbConfig};
use crate::sqlite::SqliteRowStore;

// =============================================================================
// Row Models
// =============================================================================

/// One row of `HomeAssistantEntity`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct EntityRow {
    pub unique_id: String,
    /// Assigned by the hub once it has seen the entity.
    pub entity_id: Option<String>,
    pub application_name: String,
    pub state_json: String,
    pub first_observed: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub last_reported: DateTime<Utc>,
}

impl EntityRow {
    /// Decoded snapshot.
    pub fn state(&self) -> DbResult<Value> {
        Ok(serde_json::from_str(&self.state_json)?)
    }
}

/// What `RowStore::update` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// An existing row was rewritten.
    Updated,
    /// No row existed; one was created.
    Inserted,
    /// No row existed and the app is not registered with the hub.
    Skipped,
}

// =============================================================================
// Storage Backend
// =============================================================================

/// Which row store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Sqlite => write!(f, "sqlite"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for StorageBackend {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(StorageBackend::Sqlite),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(DbError::InvalidBackend(other.to_string())),
        }
    }
}

// =============================================================================
// RowStore Trait
// =============================================================================

/// Durable storage for entity snapshots and entity locals.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Returns the row for `unique_id`, creating it from `defaults` first
    /// when it is missing.
    async fn load(&self, unique_id: &str, defaults: &Value) -> DbResult<EntityRow>;

    /// Writes the full snapshot for `unique_id`.
    async fn update(&self, unique_id: &str, content: &Value) -> DbResult<UpdateOutcome>;

    /// Records the entity id the hub assigned to `unique_id`.
    async fn set_entity_id(&self, unique_id: &str, entity_id: &str) -> DbResult<()>;

    /// Every stored local of `unique_id`.
    async fn load_locals(&self, unique_id: &str) -> DbResult<HashMap<String, Value>>;

    /// Creates or replaces one local.
    async fn update_local(&self, unique_id: &str, key: &str, value: &Value) -> DbResult<()>;

    /// Removes one local.
    async fn delete_local(&self, unique_id: &str, key: &str) -> DbResult<()>;

    /// Removes every local of `unique_id`. Returns how many were removed.
    async fn delete_locals_by_unique_id(&self, unique_id: &str) -> DbResult<u64>;

    /// Which backend this is.
    fn backend(&self) -> StorageBackend;
}

/// Opens the configured row store.
///
/// For SQLite this connects and runs migrations, so the schema exists
/// before any entity is loaded.
pub async fn open_row_store(
    backend: StorageBackend,
    config: DbConfig,
    application_name: &str,
    registration: HubRegistration,
) -> DbResult<Arc<dyn RowStore>> {
    match backend {
        StorageBackend::Sqlite => {
            let db = Database::new(config).await?;
            Ok(Arc::new(SqliteRowStore::new(db, application_name, registration)))
        }
        StorageBackend::Memory => Ok(Arc::new(MemoryRowStore::new(
            application_name,
            registration,
        ))),
    }
}
