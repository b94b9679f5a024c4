//! # synapse-sync: Entity Engine for Synapse
//!
//! This crate owns the virtual entities of an application: their in-memory
//! state, persistence through the row store, reactive recomputation and the
//! socket conversation with the hub.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Synapse Architecture                             │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   SynapseContext (Owner)                         │  │
//! │  │                                                                  │  │
//! │  │  Built once at startup, torn down on shutdown                   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │StorageRegistry │  │   SocketSync   │  │  Transport             │    │
//! │  │                │  │                │  │                        │    │
//! │  │ entity records │─►│ register       │─►│ WebSocket with         │    │
//! │  │ boot / dump    │  │ heartbeat      │  │ auto-reconnect         │    │
//! │  │ set → RowStore │  │ patch_entity   │  │ & backoff              │    │
//! │  └───────┬────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │          │                   │                                          │
//! │  ┌───────▼────────┐  ┌───────▼────────┐  ┌────────────────────────┐    │
//! │  │ReactiveSched.  │  │   EventBus     │  │  LocalsCache           │    │
//! │  │ interval and   │  │ entity events  │  │ lazy per-entity        │    │
//! │  │ trigger driven │  │ + services     │  │ scratch values         │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`context`] - `SynapseContext` and its builder
//! - [`config`] - Application, hub and storage configuration
//! - [`registry`] - Entity records, boot, dump and persistence
//! - [`entity`] - `VirtualEntity` handle for application code
//! - [`locals`] - Lazily loaded per-entity locals
//! - [`reactive`] - Reactive value recomputation
//! - [`events`] - Entity event and service dispatch
//! - [`socket`] - Hub conversation on top of a connection
//! - [`transport`] - WebSocket client with reconnection
//! - [`protocol`] - Message types exchanged with the hub
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synapse_core::{Domain, EntityOptions};
//! use synapse_sync::{SynapseConfig, SynapseContextBuilder};
//!
//! let config = SynapseConfig::load_or_default(None);
//! let mut context = SynapseContextBuilder::new(config).build().await?;
//!
//! let porch = context.add_entity(
//!     EntityOptions::new(Domain::Switch, "Porch Light").with_value("is_on", false),
//! )?;
//!
//! context.start().await?;
//! porch.set_state(true).await?;
//!
//! context.shutdown().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod events;
pub mod locals;
pub mod protocol;
pub mod reactive;
pub mod registry;
pub mod socket;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{AppConfig, HubSettings, ReactiveSettings, StorageSettings, SynapseConfig};
pub use context::{SynapseContext, SynapseContextBuilder, SynapseStatus};
pub use entity::VirtualEntity;
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, SubscriptionId};
pub use locals::{LocalsCache, LocalsHandle};
pub use protocol::{AbandonedEntity, AppMetadata, ServiceDescriptor, SynapseMessage};
pub use registry::{StorageHandle, StorageRegistry};
pub use socket::{SendOutcome, SocketPhase, SocketSync};
pub use transport::{ConnectionState, HubConnection, Transport, TransportConfig, TransportHandle};
