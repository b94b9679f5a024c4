//! # Socket Synchronization
//!
//! Keeps the hub's view of this app current over a [`HubConnection`].
//!
//! ## Phases
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ┌────────────┐  connected   ┌──────────────┐  registration_status     │
//! │  │Disconnected│ ───────────► │ Unregistered │ ──── registered=true ──┐ │
//! │  └────────────┘  (register   └──────────────┘                        │ │
//! │        ▲          is sent)          ▲                                 ▼ │
//! │        │                            │  registered=false  ┌──────────┐  │
//! │        │ connection lost            └─────────────────── │Registered│  │
//! │        └──────────────────────────────────────────────── └──────────┘  │
//! │                                                                         │
//! │  go_offline() from any phase ──► GoingOffline (terminal, sends stop)   │
//! │                                                                         │
//! │  OUTBOUND                                                              │
//! │  register / update_configuration  full metadata + dump + hash         │
//! │  heartbeat { hash }               every interval, only while connected │
//! │  patch_entity { uid, data }       connected AND registered AND online  │
//! │  going_offline {}                 once, best effort                    │
//! │                                                                         │
//! │  INBOUND                                                               │
//! │  request_configuration  ──► update_configuration                       │
//! │  service_call           ──► EventBus::call_service                     │
//! │  entity_event           ──► EventBus::emit(uid, event)                 │
//! │  registration_status    ──► registered flag + entity ids               │
//! │  result                 ──► pending request                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sends are fire-and-forget. A dropped patch is recovered by the next
//! registration, which carries the full dump.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use synapse_core::{DeviceInfo, HubRegistration};

use crate::error::{SyncError, SyncResult};
use crate::events::EventBus;
use crate::protocol::{
    AbandonedEntity, AppMetadata, EntityEventPayload, RegisterPayload,
    RegistrationStatusPayload, RequestPayload, ResultPayload, SynapseMessage,
};
use crate::registry::{dump_hash, ChangePublisher, EntityChange, StorageRegistry};
use crate::transport::{ConnectionState, HubConnection};

// =============================================================================
// Phase & Outcome
// =============================================================================

/// Where the socket layer stands with the hub.
///
/// A connection that has not yet received a registration status reads as
/// `Unregistered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPhase {
    Disconnected,
    Unregistered,
    Registered,
    GoingOffline,
}

impl std::fmt::Display for SocketPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketPhase::Disconnected => write!(f, "disconnected"),
            SocketPhase::Unregistered => write!(f, "unregistered"),
            SocketPhase::Registered => write!(f, "registered"),
            SocketPhase::GoingOffline => write!(f, "going_offline"),
        }
    }
}

/// Result of an outbound entity update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Disconnected,
    Unregistered,
    GoingOffline,
    /// The transport refused the message (queue full or closed).
    Failed,
}

// =============================================================================
// Identity
// =============================================================================

/// Static part of the registration metadata.
#[derive(Debug, Clone)]
pub struct AppIdentity {
    pub app: String,
    pub unique_id: String,
    pub title: String,
    pub hostname: String,
    pub username: String,
    pub device: DeviceInfo,
    pub secondary_devices: Vec<DeviceInfo>,
}

// =============================================================================
// Socket Sync
// =============================================================================

type PendingRequests = HashMap<u64, oneshot::Sender<SyncResult<Value>>>;

/// Socket synchronization layer.
pub struct SocketSync {
    conn: Arc<dyn HubConnection>,
    registry: Arc<StorageRegistry>,
    events: Arc<EventBus>,
    identity: AppIdentity,
    registration: HubRegistration,
    heartbeat_interval: Duration,
    going_offline: AtomicBool,
    pending: Mutex<PendingRequests>,
    next_request_id: AtomicU64,
    changes_tx: mpsc::UnboundedSender<EntityChange>,
    changes_rx: Mutex<Option<mpsc::UnboundedReceiver<EntityChange>>>,
}

impl SocketSync {
    pub fn new(
        conn: Arc<dyn HubConnection>,
        registry: Arc<StorageRegistry>,
        identity: AppIdentity,
        registration: HubRegistration,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            conn,
            events: registry.events().clone(),
            registry,
            identity,
            registration,
            heartbeat_interval,
            going_offline: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            changes_tx,
            changes_rx: Mutex::new(Some(changes_rx)),
        })
    }

    fn pending(&self) -> MutexGuard<'_, PendingRequests> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_connected(&self) -> bool {
        self.conn.state().is_connected()
    }

    pub fn is_going_offline(&self) -> bool {
        self.going_offline.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> SocketPhase {
        if self.is_going_offline() {
            SocketPhase::GoingOffline
        } else if !self.is_connected() {
            SocketPhase::Disconnected
        } else if self.registration.is_registered() {
            SocketPhase::Registered
        } else {
            SocketPhase::Unregistered
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.conn.state()
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Sends changed keys of one entity.
    pub fn send(&self, unique_id: &str, data: Value) -> SendOutcome {
        let outcome = match self.phase() {
            SocketPhase::GoingOffline => SendOutcome::GoingOffline,
            SocketPhase::Disconnected => SendOutcome::Disconnected,
            SocketPhase::Unregistered => SendOutcome::Unregistered,
            SocketPhase::Registered => {
                match self.conn.send(SynapseMessage::patch_entity(unique_id, data)) {
                    Ok(()) => return SendOutcome::Sent,
                    Err(e) => {
                        warn!(unique_id = %unique_id, error = %e, "Failed to queue entity patch");
                        SendOutcome::Failed
                    }
                }
            }
        };

        debug!(unique_id = %unique_id, ?outcome, "Entity patch dropped");
        outcome
    }

    /// Registration metadata for the current state.
    pub fn metadata(&self) -> AppMetadata {
        let entities = self.registry.dump();
        AppMetadata {
            app: self.identity.app.clone(),
            device: self.identity.device.clone(),
            hash: dump_hash(&entities),
            hostname: self.identity.hostname.clone(),
            secondary_devices: self.identity.secondary_devices.clone(),
            services: self.events.services(),
            title: self.identity.title.clone(),
            username: self.identity.username.clone(),
            entities,
        }
    }

    /// Sends `register` (on connect) or `update_configuration` (on request).
    pub fn send_configuration(&self, initial: bool) -> SyncResult<()> {
        if self.is_going_offline() {
            return Err(SyncError::ShuttingDown);
        }
        if !self.is_connected() {
            return Err(SyncError::Disconnected);
        }

        let payload = RegisterPayload {
            app_metadata: self.metadata(),
            unique_id: self.identity.unique_id.clone(),
        };
        let hash = payload.app_metadata.hash.clone();
        let message = if initial {
            SynapseMessage::Register(payload)
        } else {
            SynapseMessage::UpdateConfiguration(payload)
        };

        info!(
            msg_type = message.type_name(),
            entities = self.registry.len(),
            hash = %hash,
            "Sending configuration to hub"
        );
        self.conn.send(message)
    }

    /// Sends one heartbeat. Returns false when not connected.
    pub fn heartbeat(&self) -> bool {
        if self.is_going_offline() || !self.is_connected() {
            trace!("Skipping heartbeat while not connected");
            return false;
        }

        match self.conn.send(SynapseMessage::heartbeat(self.registry.hash())) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to queue heartbeat");
                false
            }
        }
    }

    /// Announces shutdown and suppresses every later send.
    pub fn go_offline(&self) {
        if self.going_offline.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.is_connected() {
            if let Err(e) = self.conn.send(SynapseMessage::going_offline()) {
                warn!(error = %e, "Failed to send going_offline");
            }
        }
        info!("Socket going offline");
    }

    /// Asks the hub for entities it knows but this process no longer
    /// registers.
    pub async fn abandoned_entities(&self) -> SyncResult<Vec<AbandonedEntity>> {
        let result = self.request(|id| SynapseMessage::AbandonedEntities(RequestPayload { id })).await?;
        let entities: Vec<AbandonedEntity> = serde_json::from_value(result)?;

        Ok(entities
            .into_iter()
            .filter(|entity| !self.registry.contains(&entity.unique_id))
            .collect())
    }

    async fn request<F>(&self, build: F) -> SyncResult<Value>
    where
        F: FnOnce(u64) -> SynapseMessage,
    {
        if self.is_going_offline() {
            return Err(SyncError::ShuttingDown);
        }
        if !self.is_connected() {
            return Err(SyncError::Disconnected);
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);

        if let Err(e) = self.conn.send(build(id)) {
            self.pending().remove(&id);
            return Err(e);
        }

        rx.await
            .map_err(|_| SyncError::ChannelError("Request dropped".into()))?
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Handles one message from the hub.
    pub async fn handle_message(&self, message: SynapseMessage) {
        match message {
            SynapseMessage::RequestConfiguration(_) => {
                if let Err(e) = self.send_configuration(false) {
                    warn!(error = %e, "Failed to answer request_configuration");
                }
            }
            SynapseMessage::ServiceCall(call) => {
                self.events.call_service(&call.service_name, &call.service_data);
            }
            SynapseMessage::EntityEvent(payload) => self.handle_entity_event(payload),
            SynapseMessage::RegistrationStatus(status) => {
                self.handle_registration_status(status).await;
            }
            SynapseMessage::Result(result) => self.resolve(result),
            SynapseMessage::Error(err) => {
                warn!(code = %err.code, message = %err.message, "Hub reported an error");
            }
            other => {
                warn!(msg_type = other.type_name(), "Unexpected outbound message type from hub");
            }
        }
    }

    fn handle_entity_event(&self, payload: EntityEventPayload) {
        let Some(domain) = self.registry.domain_of(&payload.unique_id) else {
            warn!(unique_id = %payload.unique_id, event = %payload.event, "Event for unknown entity");
            return;
        };
        if !domain.events().contains(&payload.event) {
            warn!(
                unique_id = %payload.unique_id,
                domain = %domain,
                event = %payload.event,
                "Event not supported by domain"
            );
            return;
        }

        let listeners = self
            .events
            .emit(&payload.unique_id, payload.event, &payload.data);
        debug!(unique_id = %payload.unique_id, event = %payload.event, listeners, "Entity event dispatched");
    }

    async fn handle_registration_status(&self, status: RegistrationStatusPayload) {
        let was = self.registration.is_registered();
        self.registration.set_registered(status.registered);
        if was != status.registered {
            info!(registered = status.registered, "Hub registration changed");
        }

        for (unique_id, entity_id) in &status.entities {
            if let Err(e) = self.registry.confirm_entity_id(unique_id, entity_id).await {
                error!(unique_id = %unique_id, error = %e, "Failed to record entity id");
            }
        }
    }

    fn resolve(&self, result: ResultPayload) {
        let Some(tx) = self.pending().remove(&result.id) else {
            debug!(id = result.id, "Result for unknown request");
            return;
        };

        let outcome = if result.success {
            Ok(result.result)
        } else {
            Err(SyncError::RequestFailed(result.result.to_string()))
        };
        let _ = tx.send(outcome);
    }

    // =========================================================================
    // Connection Transitions
    // =========================================================================

    fn on_connected(&self) {
        info!("Hub connection established");
        if let Err(e) = self.send_configuration(true) {
            warn!(error = %e, "Failed to register with hub");
        }
    }

    fn on_disconnected(&self, state: ConnectionState) {
        self.registration.set_registered(false);

        let pending: Vec<_> = self.pending().drain().map(|(_, tx)| tx).collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), "Failing requests pending on lost connection");
        }
        for tx in pending {
            let _ = tx.send(Err(SyncError::Disconnected));
        }

        info!(%state, "Hub connection lost");
    }

    // =========================================================================
    // Main Loop
    // =========================================================================

    /// Drives the socket until `shutdown` flips to true.
    ///
    /// Can only run once; the change queue is taken on the first call.
    pub async fn run(
        self: Arc<Self>,
        mut incoming: mpsc::Receiver<SynapseMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let Some(mut changes) = self
            .changes_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        else {
            error!("Socket loop already running");
            return;
        };

        let mut state_rx = self.conn.subscribe_state();
        let mut connected = state_rx.borrow_and_update().is_connected();
        let mut epoch = self.conn.connection_epoch();
        if connected {
            self.on_connected();
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        warn!("Connection state channel closed");
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    let current_epoch = self.conn.connection_epoch();
                    match (connected, state.is_connected()) {
                        (false, true) => {
                            connected = true;
                            epoch = current_epoch;
                            heartbeat.reset();
                            self.on_connected();
                        }
                        (true, false) => {
                            connected = false;
                            self.on_disconnected(state);
                        }
                        (true, true) if current_epoch != epoch => {
                            debug!(from = epoch, to = current_epoch, "Reconnected between state reads");
                            self.on_disconnected(ConnectionState::Reconnecting);
                            epoch = current_epoch;
                            heartbeat.reset();
                            self.on_connected();
                        }
                        _ => {}
                    }
                }

                _ = heartbeat.tick() => {
                    self.heartbeat();
                }

                Some(message) = incoming.recv() => {
                    self.handle_message(message).await;
                }

                Some(first) = changes.recv() => {
                    for (unique_id, data) in coalesce(first, &mut changes) {
                        self.send(&unique_id, Value::Object(data));
                    }
                }

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Socket loop stopped");
    }
}

/// Merges every change already queued behind `first` into one patch per
/// entity, in arrival order. Later values of a key win.
fn coalesce(
    first: EntityChange,
    queue: &mut mpsc::UnboundedReceiver<EntityChange>,
) -> Vec<(String, Map<String, Value>)> {
    let mut patches: Vec<(String, Map<String, Value>)> = Vec::new();
    let mut next = Some(first);

    while let Some(change) = next {
        match patches.iter_mut().find(|(uid, _)| *uid == change.unique_id) {
            Some((_, data)) => {
                data.insert(change.key, change.value);
            }
            None => {
                let mut data = Map::new();
                data.insert(change.key, change.value);
                patches.push((change.unique_id, data));
            }
        }
        next = queue.try_recv().ok();
    }

    patches
}

impl ChangePublisher for SocketSync {
    fn is_live(&self) -> bool {
        !self.is_going_offline() && self.is_connected()
    }

    fn publish(&self, change: EntityChange) {
        if self.changes_tx.send(change).is_err() {
            debug!("Change queue closed, dropping change");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    use synapse_core::{Domain, EntityEvent, EntityOptions};
    use synapse_db::MemoryRowStore;

    use crate::protocol::{EmptyPayload, ServiceCallPayload, ServiceDescriptor};

    /// Connection that records every message instead of sending it.
    struct RecordingHub {
        state: watch::Sender<ConnectionState>,
        epoch: AtomicU64,
        sent: Mutex<Vec<SynapseMessage>>,
    }

    impl RecordingHub {
        fn new(state: ConnectionState) -> Arc<Self> {
            let (state, _) = watch::channel(state);
            Arc::new(Self {
                state,
                epoch: AtomicU64::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn set_state(&self, state: ConnectionState) {
            if state.is_connected() {
                self.epoch.fetch_add(1, Ordering::SeqCst);
            }
            self.state.send_replace(state);
        }

        fn sent(&self) -> Vec<SynapseMessage> {
            self.sent.lock().unwrap().clone()
        }

        fn count(&self, type_name: &str) -> usize {
            self.sent()
                .iter()
                .filter(|msg| msg.type_name() == type_name)
                .count()
        }
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
            self.epoch.load(Ordering::SeqCst)
        }
    }

    struct Fixture {
        hub: Arc<RecordingHub>,
        store: Arc<MemoryRowStore>,
        registry: Arc<StorageRegistry>,
        registration: HubRegistration,
        socket: Arc<SocketSync>,
    }

    async fn fixture(state: ConnectionState) -> Fixture {
        let registration = HubRegistration::new();
        let store = Arc::new(MemoryRowStore::new("home", registration.clone()));
        let registry = StorageRegistry::new(
            "home",
            store.clone(),
            Arc::new(EventBus::new()),
            Duration::from_secs(30),
        );
        registry
            .add(
                EntityOptions::new(Domain::Switch, "Porch")
                    .with_unique_id("sw1")
                    .with_value("is_on", false),
            )
            .unwrap();
        registry.boot().await.unwrap();

        let hub = RecordingHub::new(state);
        let socket = SocketSync::new(
            hub.clone(),
            registry.clone(),
            AppIdentity {
                app: "home".into(),
                unique_id: "app-1".into(),
                title: "Home".into(),
                hostname: "pi".into(),
                username: "pi".into(),
                device: DeviceInfo {
                    name: "Agent".into(),
                    ..Default::default()
                },
                secondary_devices: Vec::new(),
            },
            registration.clone(),
            Duration::from_secs(30),
        );
        registry.attach_publisher(socket.clone());

        Fixture {
            hub,
            store,
            registry,
            registration,
            socket,
        }
    }

    #[tokio::test]
    async fn test_set_while_disconnected_persists_without_sending() {
        let f = fixture(ConnectionState::Disconnected).await;

        f.registry.set("sw1", "is_on", json!(true)).await.unwrap();

        let row = f.store.row("sw1").await.unwrap();
        assert_eq!(row.state().unwrap()["is_on"], json!(true));
        assert!(f.hub.sent().is_empty());
        assert_eq!(f.socket.phase(), SocketPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_send_requires_registration() {
        let f = fixture(ConnectionState::Connected).await;

        assert_eq!(f.socket.send("sw1", json!({ "is_on": true })), SendOutcome::Unregistered);
        assert_eq!(f.hub.count("patch_entity"), 0);

        f.registration.set_registered(true);
        assert_eq!(f.socket.send("sw1", json!({ "is_on": true })), SendOutcome::Sent);
        assert_eq!(f.hub.count("patch_entity"), 1);
    }

    #[tokio::test]
    async fn test_request_configuration_resends_full_dump() {
        let f = fixture(ConnectionState::Connected).await;

        f.socket
            .handle_message(SynapseMessage::RequestConfiguration(EmptyPayload {}))
            .await;

        let sent = f.hub.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            SynapseMessage::UpdateConfiguration(payload) => {
                assert_eq!(payload.unique_id, "app-1");
                assert_eq!(payload.app_metadata.hash, f.registry.hash());
                assert_eq!(payload.app_metadata.entities, f.registry.dump());
                assert_eq!(
                    payload.app_metadata.entities["switch"]["sw1"]["is_on"],
                    json!(false)
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nothing_sent_after_going_offline() {
        let f = fixture(ConnectionState::Connected).await;
        f.registration.set_registered(true);

        f.socket.go_offline();
        f.socket.go_offline();

        assert_eq!(f.socket.phase(), SocketPhase::GoingOffline);
        assert_eq!(f.socket.send("sw1", json!({ "is_on": true })), SendOutcome::GoingOffline);
        assert!(!f.socket.heartbeat());
        assert!(f.socket.send_configuration(false).is_err());
        assert!(f.socket.abandoned_entities().await.is_err());

        let sent = f.hub.sent();
        assert_eq!(sent, vec![SynapseMessage::going_offline()]);
        assert!(!f.socket.is_live());
    }

    #[tokio::test]
    async fn test_heartbeat_only_while_connected() {
        let f = fixture(ConnectionState::Disconnected).await;
        assert!(!f.socket.heartbeat());

        f.hub.set_state(ConnectionState::Connected);
        assert!(f.socket.heartbeat());

        match &f.hub.sent()[0] {
            SynapseMessage::Heartbeat(payload) => assert_eq!(payload.hash, f.registry.hash()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_heartbeats_stop_when_disconnected() {
        let f = fixture(ConnectionState::Disconnected).await;
        let (_incoming_tx, incoming_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(f.socket.clone().run(incoming_rx, shutdown_rx));

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(f.hub.count("heartbeat"), 0);

        f.hub.set_state(ConnectionState::Connected);
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(f.hub.count("register"), 1);
        let beats = f.hub.count("heartbeat");
        assert!(beats >= 1);

        f.hub.set_state(ConnectionState::Backoff);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(f.hub.count("heartbeat"), beats);

        shutdown_tx.send_replace(true);
        task.await.unwrap();
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_run_loop_sends_coalesced_patch_for_registry_sets() {
        let f = fixture(ConnectionState::Connected).await;
        f.registration.set_registered(true);
        let (_incoming_tx, incoming_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(f.socket.clone().run(incoming_rx, shutdown_rx));
        settle().await;

        f.registry.set("sw1", "is_on", json!(true)).await.unwrap();
        f.registry.set("sw1", "icon", json!("mdi:a")).await.unwrap();
        settle().await;

        let patches: Vec<SynapseMessage> = f
            .hub
            .sent()
            .into_iter()
            .filter(|msg| msg.type_name() == "patch_entity")
            .collect();
        assert_eq!(
            patches,
            vec![SynapseMessage::patch_entity(
                "sw1",
                json!({ "is_on": true, "icon": "mdi:a" })
            )]
        );

        shutdown_tx.send_replace(true);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_without_observed_drop_registers_again() {
        let f = fixture(ConnectionState::Connected).await;
        let (_incoming_tx, incoming_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(f.socket.clone().run(incoming_rx, shutdown_rx));
        settle().await;
        assert_eq!(f.hub.count("register"), 1);
        f.registration.set_registered(true);

        // Drop and reconnect before the loop gets to run again.
        f.hub.set_state(ConnectionState::Backoff);
        f.hub.set_state(ConnectionState::Connected);
        settle().await;

        assert_eq!(f.hub.count("register"), 2);
        assert_eq!(f.socket.phase(), SocketPhase::Unregistered);

        shutdown_tx.send_replace(true);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_registration_status_sets_flag_and_entity_ids() {
        let f = fixture(ConnectionState::Connected).await;

        let mut entities = std::collections::BTreeMap::new();
        entities.insert("sw1".to_string(), "switch.porch".to_string());
        f.socket
            .handle_message(SynapseMessage::RegistrationStatus(RegistrationStatusPayload {
                registered: true,
                entities,
            }))
            .await;

        assert_eq!(f.socket.phase(), SocketPhase::Registered);
        assert_eq!(f.registry.entity_id("sw1").as_deref(), Some("switch.porch"));
        assert_eq!(
            f.store.row("sw1").await.unwrap().entity_id.as_deref(),
            Some("switch.porch")
        );
    }

    #[tokio::test]
    async fn test_service_call_becomes_local_event() {
        let f = fixture(ConnectionState::Connected).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        f.registry.events().register_service(
            ServiceDescriptor {
                name: "reload".into(),
                description: String::new(),
                fields: Value::Null,
            },
            move |data| {
                assert_eq!(data["force"], json!(true));
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        f.socket
            .handle_message(SynapseMessage::ServiceCall(ServiceCallPayload {
                service_name: "reload".into(),
                service_data: json!({ "force": true }),
            }))
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.socket.metadata().services.len(), 1);
    }

    #[tokio::test]
    async fn test_entity_event_respects_domain() {
        let f = fixture(ConnectionState::Connected).await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        f.registry.events().subscribe("sw1", EntityEvent::TurnOn, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for event in [EntityEvent::TurnOn, EntityEvent::Press] {
            f.socket
                .handle_message(SynapseMessage::EntityEvent(EntityEventPayload {
                    unique_id: "sw1".into(),
                    event,
                    data: Value::Null,
                }))
                .await;
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_entities_round_trip() {
        let f = fixture(ConnectionState::Connected).await;
        let socket = f.socket.clone();
        let request = tokio::spawn(async move { socket.abandoned_entities().await });

        let id = loop {
            let found = f.hub.sent().iter().find_map(|msg| match msg {
                SynapseMessage::AbandonedEntities(payload) => Some(payload.id),
                _ => None,
            });
            match found {
                Some(id) => break id,
                None => tokio::task::yield_now().await,
            }
        };

        f.socket
            .handle_message(SynapseMessage::Result(ResultPayload {
                id,
                success: true,
                result: json!([
                    { "unique_id": "sw1", "entity_id": "switch.porch" },
                    { "unique_id": "old", "entity_id": "switch.old" }
                ]),
            }))
            .await;

        let abandoned = request.await.unwrap().unwrap();
        assert_eq!(
            abandoned,
            vec![AbandonedEntity {
                unique_id: "old".into(),
                entity_id: Some("switch.old".into()),
            }]
        );
    }

    #[tokio::test]
    async fn test_pending_request_fails_on_disconnect() {
        let f = fixture(ConnectionState::Connected).await;
        let socket = f.socket.clone();
        let request = tokio::spawn(async move { socket.abandoned_entities().await });

        while f.hub.count("abandoned_entities") == 0 {
            tokio::task::yield_now().await;
        }
        f.socket.on_disconnected(ConnectionState::Backoff);

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::Disconnected));
    }

    #[test]
    fn test_coalesce_merges_per_entity() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let change = |uid: &str, key: &str, value: Value| EntityChange {
            unique_id: uid.into(),
            key: key.into(),
            value,
        };
        tx.send(change("sw2", "is_on", json!(true))).unwrap();
        tx.send(change("sw1", "icon", json!("mdi:a"))).unwrap();
        tx.send(change("sw1", "is_on", json!(false))).unwrap();

        let patches = coalesce(change("sw1", "is_on", json!(true)), &mut rx);

        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].0, "sw1");
        assert_eq!(Value::Object(patches[0].1.clone()), json!({ "is_on": false, "icon": "mdi:a" }));
        assert_eq!(patches[1].0, "sw2");
    }
}
