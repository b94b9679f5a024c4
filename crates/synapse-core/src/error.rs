//! # Error Types
//!
//! Domain-specific error types for synapse-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  synapse-core errors (this file)                                       │
//! │  ├── CoreError        - Programmer errors in entity definitions        │
//! │  └── ValidationError  - Malformed typed values                         │
//! │                                                                         │
//! │  synapse-db errors (separate crate)                                    │
//! │  └── DbError          - Row store I/O failures                         │
//! │                                                                         │
//! │  synapse-sync errors (separate crate)                                  │
//! │  └── SyncError        - Config, transport, protocol + wraps both above │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every `CoreError` is fatal: it signals a bug in the calling application
//! (duplicate ids, writes to creation-only keys, bad values) rather than a
//! runtime condition worth retrying.

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Fatal entity-definition errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Two registrations resolved to the same unique id.
    ///
    /// ## When This Occurs
    /// - The same `unique_id` passed to two entities
    /// - Two entities of one domain with the same name and no explicit id
    ///
    /// The first registration stays in place.
    #[error("Duplicate unique_id '{unique_id}' ({domain}); first registration kept")]
    DuplicateUniqueId { unique_id: String, domain: String },

    /// A creation-only key was written after the entity was created.
    #[error("Key '{key}' of {unique_id} cannot be changed after creation")]
    ImmutableKey { unique_id: String, key: String },

    /// A key outside the entity's declared key set.
    #[error("Key '{key}' is not declared for {unique_id}")]
    UnknownKey { unique_id: String, key: String },

    /// No entity registered under this unique id.
    #[error("Entity not registered: {0}")]
    UnknownEntity(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Value validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., invalid date, invalid timestamp).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value has the wrong JSON type for its key.
    #[error("{field} must be {expected}")]
    WrongType { field: String, expected: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
