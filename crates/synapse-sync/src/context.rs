//! # Synapse Context
//!
//! Explicit owner of every process-lifetime component. Created once at
//! startup, passed to whoever needs it, torn down by [`SynapseContext::shutdown`].
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SynapseContextBuilder::new(config).build()                            │
//! │     └── opens the row store (sqlite / memory), creates registry,       │
//! │         locals cache and event bus                                     │
//! │                                                                         │
//! │  context.add_entity(..)   ×N       entities + reactive bindings        │
//! │  context.register_service(..)      services listed in app_metadata     │
//! │                                                                         │
//! │  context.start()                                                        │
//! │     ├── registry.boot()            rows loaded, records initialized    │
//! │     ├── Transport::spawn(..)       only when hub.url is configured     │
//! │     └── SocketSync::run(..)        register / heartbeat / patches      │
//! │                                                                         │
//! │  context.shutdown()                                                     │
//! │     ├── socket.go_offline()        going_offline, later sends dropped  │
//! │     ├── transport.shutdown()       queued messages flushed, closed     │
//! │     └── registry.shutdown()        reactive tasks stopped              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use serde_json::Value;
use synapse_core::{EntityOptions, HubRegistration};
use synapse_db::{open_row_store, RowStore, StorageBackend};

use crate::config::SynapseConfig;
use crate::entity::VirtualEntity;
use crate::error::{SyncError, SyncResult};
use crate::events::EventBus;
use crate::locals::{LocalsCache, LocalsHandle};
use crate::protocol::{AbandonedEntity, ServiceDescriptor, SynapseMessage};
use crate::registry::StorageRegistry;
use crate::socket::{AppIdentity, SocketPhase, SocketSync};
use crate::transport::{ConnectionState, HubConnection, Transport, TransportHandle};

/// How long shutdown waits for the socket loop to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Status
// =============================================================================

/// Point-in-time summary for logs and diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct SynapseStatus {
    pub app: String,
    pub backend: StorageBackend,
    pub entities: usize,
    pub booted: bool,
    pub connection_state: ConnectionState,
    pub phase: SocketPhase,
    pub hash: String,
}

// =============================================================================
// Context
// =============================================================================

/// Owns the registry, stores, event bus, socket and transport.
pub struct SynapseContext {
    config: Arc<SynapseConfig>,
    registration: HubRegistration,
    store: Arc<dyn RowStore>,
    events: Arc<EventBus>,
    registry: Arc<StorageRegistry>,
    locals: Arc<LocalsCache>,

    /// Connection injected by the builder instead of a WebSocket transport.
    connection: Option<(Arc<dyn HubConnection>, mpsc::Receiver<SynapseMessage>)>,

    /// Set after start.
    transport: Option<TransportHandle>,
    socket: Option<Arc<SocketSync>>,
    socket_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl SynapseContext {
    pub fn config(&self) -> &SynapseConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<StorageRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    pub fn socket(&self) -> Option<&Arc<SocketSync>> {
        self.socket.as_ref()
    }

    /// Registers an entity. See [`StorageRegistry::add`] for the errors.
    pub fn add_entity(&self, options: EntityOptions) -> SyncResult<VirtualEntity> {
        let locals_defaults = options.locals.clone();
        let storage = self.registry.add(options)?;
        let locals = LocalsHandle::new(self.locals.clone(), storage.unique_id(), locals_defaults);
        Ok(VirtualEntity::new(storage, locals, self.events.clone()))
    }

    /// Declares a service the hub may call.
    pub fn register_service<F>(&self, descriptor: ServiceDescriptor, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.events.register_service(descriptor, handler);
    }

    /// Boots the registry and, when a hub is configured, connects to it.
    ///
    /// Call after every entity of the process has been added.
    pub async fn start(&mut self) -> SyncResult<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        if !self.registry.is_booted() {
            self.registry.boot().await?;
        }

        let (conn, incoming) = match self.connection.take() {
            Some(injected) => injected,
            None => match self.config.transport_config() {
                Some(transport_config) => {
                    info!(url = %transport_config.url, "Connecting to hub");
                    let (handle, incoming) = Transport::spawn(transport_config);
                    self.transport = Some(handle.clone());
                    (Arc::new(handle) as Arc<dyn HubConnection>, incoming)
                }
                None => {
                    warn!("No hub URL configured, running without hub");
                    return Ok(());
                }
            },
        };

        let socket = SocketSync::new(
            conn,
            self.registry.clone(),
            self.identity(),
            self.registration.clone(),
            self.config.hub.heartbeat_interval(),
        );
        self.registry.attach_publisher(socket.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.socket_task = Some(tokio::spawn(socket.clone().run(incoming, shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);
        self.socket = Some(socket);

        info!(
            app = %self.config.app.name,
            entities = self.registry.len(),
            "Synapse started"
        );
        Ok(())
    }

    fn identity(&self) -> AppIdentity {
        AppIdentity {
            app: self.config.app.name.clone(),
            unique_id: self.config.app.unique_id.clone(),
            title: self.config.app.title.clone(),
            hostname: self.config.app.hostname(),
            username: self.config.app.username(),
            device: self.config.device.clone(),
            secondary_devices: self.config.secondary_devices.clone(),
        }
    }

    /// Entities the hub knows but this process no longer registers.
    pub async fn abandoned_entities(&self) -> SyncResult<Vec<AbandonedEntity>> {
        match &self.socket {
            Some(socket) => socket.abandoned_entities().await,
            None => Err(SyncError::Disconnected),
        }
    }

    pub fn status(&self) -> SynapseStatus {
        let (connection_state, phase) = match &self.socket {
            Some(socket) => (socket.connection_state(), socket.phase()),
            None => (ConnectionState::Disconnected, SocketPhase::Disconnected),
        };

        SynapseStatus {
            app: self.config.app.name.clone(),
            backend: self.store.backend(),
            entities: self.registry.len(),
            booted: self.registry.is_booted(),
            connection_state,
            phase,
            hash: self.registry.hash(),
        }
    }

    /// Stops the engine. Safe to call more than once.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        info!("Shutting down synapse");

        if let Some(socket) = &self.socket {
            socket.go_offline();
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }

        if let Some(transport) = &self.transport {
            transport.shutdown();
        }

        self.registry.detach_publisher();
        self.registry.shutdown();

        if let Some(task) = self.socket_task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("Socket loop did not stop in time");
            }
        }

        info!("Synapse stopped");
        Ok(())
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`SynapseContext`].
pub struct SynapseContextBuilder {
    config: SynapseConfig,
    store: Option<(Arc<dyn RowStore>, HubRegistration)>,
    connection: Option<(Arc<dyn HubConnection>, mpsc::Receiver<SynapseMessage>)>,
}

impl SynapseContextBuilder {
    pub fn new(config: SynapseConfig) -> Self {
        SynapseContextBuilder {
            config,
            store: None,
            connection: None,
        }
    }

    /// Uses an already opened row store. `registration` must be the flag the
    /// store was created with.
    pub fn with_store(mut self, store: Arc<dyn RowStore>, registration: HubRegistration) -> Self {
        self.store = Some((store, registration));
        self
    }

    /// Uses `connection` instead of a WebSocket transport.
    pub fn with_connection(
        mut self,
        connection: Arc<dyn HubConnection>,
        incoming: mpsc::Receiver<SynapseMessage>,
    ) -> Self {
        self.connection = Some((connection, incoming));
        self
    }

    /// Validates the config and opens the configured row store.
    pub async fn build(self) -> SyncResult<SynapseContext> {
        self.config.validate()?;

        let (store, registration) = match self.store {
            Some(provided) => provided,
            None => {
                let registration = HubRegistration::new();
                let store = open_row_store(
                    self.config.storage.backend()?,
                    self.config.storage.db_config(),
                    &self.config.app.name,
                    registration.clone(),
                )
                .await?;
                (store, registration)
            }
        };

        let events = Arc::new(EventBus::new());
        let registry = StorageRegistry::new(
            self.config.app.name.clone(),
            store.clone(),
            events.clone(),
            self.config.reactive.default_interval(),
        );

        info!(
            app = %self.config.app.name,
            backend = %store.backend(),
            "Synapse context created"
        );

        Ok(SynapseContext {
            config: Arc::new(self.config),
            registration,
            locals: Arc::new(LocalsCache::new(store.clone())),
            store,
            events,
            registry,
            connection: self.connection,
            transport: None,
            socket: None,
            socket_task: None,
            shutdown_tx: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    use synapse_core::Domain;

    use crate::socket::SendOutcome;

    struct RecordingHub {
        state: watch::Sender<ConnectionState>,
        sent: Mutex<Vec<SynapseMessage>>,
    }

    impl HubConnection for RecordingHub {
        fn state(&self) -> ConnectionState {
            *self.state.borrow()
        }

        fn send(&self, message: SynapseMessage) -> SyncResult<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
            self.state.subscribe()
        }

        fn connection_epoch(&self) -> u64 {
            1
        }
    }

    fn memory_config() -> SynapseConfig {
        let mut config = SynapseConfig::default();
        config.app.name = "home".into();
        config.storage.backend = "memory".into();
        config
    }

    #[tokio::test]
    async fn test_offline_context_boots_and_persists() {
        let mut context = SynapseContextBuilder::new(memory_config()).build().await.unwrap();
        let porch = context
            .add_entity(
                EntityOptions::new(Domain::Switch, "Porch")
                    .with_unique_id("sw1")
                    .with_value("is_on", false),
            )
            .unwrap();

        context.start().await.unwrap();
        assert!(context.socket().is_none());
        assert!(porch.storage().is_initialized());

        porch.set_state(true).await.unwrap();
        let row = context.store().load("sw1", &json!({})).await.unwrap();
        assert_eq!(row.state().unwrap()["is_on"], json!(true));

        let status = context.status();
        assert_eq!(status.backend, StorageBackend::Memory);
        assert_eq!(status.entities, 1);
        assert!(status.booted);
        assert_eq!(status.phase, SocketPhase::Disconnected);
        assert!(context.abandoned_entities().await.is_err());

        context.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connected_context_registers_and_goes_offline() {
        let (state, _) = watch::channel(ConnectionState::Connected);
        let hub = Arc::new(RecordingHub {
            state,
            sent: Mutex::new(Vec::new()),
        });
        let (_incoming_tx, incoming_rx) = mpsc::channel(8);

        let mut context = SynapseContextBuilder::new(memory_config())
            .with_connection(hub.clone(), incoming_rx)
            .build()
            .await
            .unwrap();
        context
            .add_entity(EntityOptions::new(Domain::Button, "Doorbell").with_unique_id("bell"))
            .unwrap();
        context.register_service(
            ServiceDescriptor {
                name: "reload".into(),
                description: "Reload automations".into(),
                fields: Value::Null,
            },
            |_| {},
        );

        context.start().await.unwrap();
        for _ in 0..50 {
            if !hub.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        match &hub.sent.lock().unwrap()[0] {
            SynapseMessage::Register(payload) => {
                assert_eq!(payload.unique_id, context.config().app.unique_id);
                assert!(payload.app_metadata.entities["button"].contains_key("bell"));
                assert_eq!(payload.app_metadata.services[0].name, "reload");
            }
            other => panic!("unexpected {:?}", other),
        }

        let socket = context.socket().cloned().unwrap();
        context.shutdown().await.unwrap();

        assert_eq!(socket.send("bell", json!({})), SendOutcome::GoingOffline);
        let sent = hub.sent.lock().unwrap();
        assert_eq!(sent.last(), Some(&SynapseMessage::going_offline()));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = memory_config();
        config.hub.url = Some("http://not-a-socket".into());

        let err = SynapseContextBuilder::new(config).build().await.err().unwrap();
        assert!(err.is_config_error());
    }
}
