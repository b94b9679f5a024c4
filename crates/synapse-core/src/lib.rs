//! # synapse-core: Pure Entity Model for Synapse
//!
//! This crate describes virtual entities without touching the outside world:
//! which domains exist, which keys each domain persists, how a record's value
//! object is kept consistent, and how identifiers and content hashes are
//! derived.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Synapse Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Application code (entity façades)               │   │
//! │  │     switch.set_is_on(true)   sensor.set_state(21.5)            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             synapse-sync (registry, locals, socket)             │   │
//! │  └──────────────┬──────────────────────────────┬───────────────────┘   │
//! │                 │                              │                        │
//! │  ┌──────────────▼──────────────┐   ┌──────────▼──────────────────┐    │
//! │  │ ★ synapse-core (THIS) ★      │   │ synapse-db (row store)      │    │
//! │  │  types   options   record   │   │  SQLite / memory backends   │    │
//! │  │  validation   hashing       │   └─────────────────────────────┘    │
//! │  │  NO I/O • PURE FUNCTIONS    │                                       │
//! │  └─────────────────────────────┘                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domains, key catalogue, event kinds, device info
//! - [`options`] - Entity registration options and reactive bindings
//! - [`record`] - The in-memory record behind every registered entity
//! - [`validation`] - Typed value checks
//! - [`hashing`] - Unique id derivation and dump hashing
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use synapse_core::{Domain, EntityOptions, EntityRecord};
//!
//! let options = EntityOptions::new(Domain::Switch, "Kitchen Light")
//!     .with_unique_id("sw1")
//!     .with_value("is_on", false);
//!
//! let record = EntityRecord::new("sw1", Domain::Switch, options.keys(), options.static_values())
//!     .unwrap();
//! assert_eq!(record.get("is_on"), Some(&serde_json::json!(false)));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod hashing;
pub mod options;
pub mod record;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use options::{ConfigValue, EntityOptions, ReactiveBinding};
pub use record::EntityRecord;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Keys every entity persists regardless of domain.
pub const COMMON_KEYS: &[&str] = &[
    "attributes",
    "entity_category",
    "entity_picture",
    "icon",
    "name",
    "suggested_object_id",
    "translation_key",
];

/// Keys fixed at creation time.
///
/// The hub derives registry metadata from these, so they may only be given
/// in the registration options. Any later `set` fails with
/// [`CoreError::ImmutableKey`].
pub const NO_LIVE_UPDATE: &[&str] = &["device_class", "suggested_object_id", "translation_key"];

/// Returns true if `key` may not be changed after the entity is created.
pub fn is_immutable_key(key: &str) -> bool {
    NO_LIVE_UPDATE.contains(&key)
}
