//! # Repository Module
//!
//! SQL for the two row store tables.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SqliteRowStore                                                        │
//! │       │                                                                 │
//! │       ├── EntityRepository  → HomeAssistantEntity                      │
//! │       │     find / insert_if_missing / update_state / upsert_state     │
//! │       │     set_entity_id / list_by_application                        │
//! │       │                                                                 │
//! │       └── LocalsRepository  → HomeAssistantEntityLocals                │
//! │             list / upsert / delete / delete_all                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Repositories speak rows and JSON text; decoding into values and the
//! "skip unknown entities" policy live in [`crate::sqlite`].

pub mod entity;
pub mod locals;
