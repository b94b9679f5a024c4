//! # synapse-db: Row Store for Synapse
//!
//! This crate persists entity snapshots and entity locals so that every
//! virtual entity comes back with its last known state after a restart.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Synapse Data Flow                               │
//! │                                                                         │
//! │  StorageRegistry::set / LocalsCache::set  (synapse-sync)               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   synapse-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  dyn RowStore │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │  (store.rs)   │    │ entity.rs     │    │  (embedded)  │  │   │
//! │  │   │               │    │ locals.rs     │    │              │  │   │
//! │  │   │ SqliteRowStore│───►│               │    │ 001_init.sql │  │   │
//! │  │   │ MemoryRowStore│    │               │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SQLite: HomeAssistantEntity, HomeAssistantEntityLocals        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`store`] - The `RowStore` trait, its row models and backend selection
//! - [`sqlite`] - SQLite-backed row store
//! - [`memory`] - In-process row store
//! - [`repository`] - SQL for the two tables
//! - [`error`] - Database error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synapse_db::{open_row_store, DbConfig, StorageBackend};
//!
//! let store = open_row_store(
//!     StorageBackend::Sqlite,
//!     DbConfig::new("synapse.db"),
//!     "home_automation",
//!     registration.clone(),
//! ).await?;
//!
//! let row = store.load("sw1", &json!({ "is_on": false })).await?;
//! store.update("sw1", &json!({ "is_on": true })).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod memory;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod sqlite;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use memory::MemoryRowStore;
pub use pool::{Database, DbConfig};
pub use sqlite::SqliteRowStore;
pub use store::{open_row_store, EntityRow, RowStore, StorageBackend, UpdateOutcome};

// Repository re-exports for convenience
pub use repository::entity::EntityRepository;
pub use repository::locals::{LocalRow, LocalsRepository};
