//! # Entity Storage Registry
//!
//! Owns the in-memory record of every registered entity and is the only
//! path through which persisted entity state changes.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  set(uid, key, value)                                                  │
//! │     │                                                                   │
//! │     ├── immutable key?  ──► CoreError::ImmutableKey (fatal)            │
//! │     ├── unknown key?    ──► CoreError::UnknownKey   (fatal)            │
//! │     ├── bad value?      ──► CoreError::Validation   (fatal)            │
//! │     ▼                                                                   │
//! │  current_value[key] = value          (always, no dirty check)          │
//! │     │                                                                   │
//! │     ├── initialized? ── no ──► stop (boot merge will decide)           │
//! │     ▼ yes                                                               │
//! │  RowStore::update(uid, full snapshot)   (awaited, errors propagate)    │
//! │     │                                                                   │
//! │     ├── publisher live? ── yes ──► publish { uid, key, value }         │
//! │     ▼                              (coalesced per tick by the socket)  │
//! │  EventBus::emit(uid, Update, { key: value })                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Boot
//! Runs once every entity of the process has been added. Each entity's row
//! is loaded (created from the in-memory defaults if missing), the persisted
//! snapshot overwrites the defaults, and only then is the record marked
//! initialized. Entities added after boot are loaded in the background.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, error, info};

use synapse_core::hashing::{content_hash, derive_unique_id};
use synapse_core::validation::validate_unique_id;
use synapse_core::{
    is_immutable_key, CoreError, Domain, EntityEvent, EntityOptions, EntityRecord,
};
use synapse_db::RowStore;

use crate::error::SyncResult;
use crate::events::EventBus;
use crate::protocol::EntityDump;
use crate::reactive::ReactiveScheduler;

// =============================================================================
// Change Publishing
// =============================================================================

/// One changed key, handed to the socket layer.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange {
    pub unique_id: String,
    pub key: String,
    pub value: Value,
}

/// Receives persisted changes for delivery to the hub.
pub trait ChangePublisher: Send + Sync {
    /// True while the hub connection can take changes.
    fn is_live(&self) -> bool;

    /// Queues a change. Must not block.
    fn publish(&self, change: EntityChange);
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Default)]
struct Entities {
    records: HashMap<String, EntityRecord>,
    /// Registration order, used for boot and dumps.
    order: Vec<String>,
}

/// Registry of every entity this process publishes.
pub struct StorageRegistry {
    application_name: String,
    entities: RwLock<Entities>,
    store: Arc<dyn RowStore>,
    events: Arc<EventBus>,
    reactive: ReactiveScheduler,
    publisher: RwLock<Option<Arc<dyn ChangePublisher>>>,
    booted: AtomicBool,
}

impl StorageRegistry {
    pub fn new(
        application_name: impl Into<String>,
        store: Arc<dyn RowStore>,
        events: Arc<EventBus>,
        default_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            application_name: application_name.into(),
            entities: RwLock::new(Entities::default()),
            store,
            reactive: ReactiveScheduler::new(events.clone(), default_interval),
            events,
            publisher: RwLock::new(None),
            booted: AtomicBool::new(false),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Entities> {
        self.entities.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entities> {
        self.entities.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn reactive(&self) -> &ReactiveScheduler {
        &self.reactive
    }

    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    /// Connects the registry to the socket layer.
    pub fn attach_publisher(&self, publisher: Arc<dyn ChangePublisher>) {
        *self
            .publisher
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(publisher);
    }

    /// Disconnects the socket layer again. Later writes stay local.
    pub fn detach_publisher(&self) {
        self.publisher
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    fn publisher(&self) -> Option<Arc<dyn ChangePublisher>> {
        self.publisher
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// True once boot has started. Entities added from then on are loaded
    /// by `add` itself.
    pub fn is_booted(&self) -> bool {
        self.booted.load(Ordering::Acquire)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Registers an entity and returns its storage handle.
    ///
    /// Static values are copied into the record; reactive keys start at
    /// null and are filled by the scheduler.
    ///
    /// ## Errors
    /// - [`CoreError::DuplicateUniqueId`] if the id is taken. The existing
    ///   record is left untouched.
    /// - [`CoreError::ImmutableKey`] for a reactive binding on a
    ///   creation-only key.
    /// - [`CoreError::UnknownKey`] / [`CoreError::Validation`] for bad
    ///   static values.
    pub fn add(self: &Arc<Self>, options: EntityOptions) -> SyncResult<StorageHandle> {
        let domain = options.domain;
        let unique_id = match &options.unique_id {
            Some(unique_id) => unique_id.clone(),
            None => derive_unique_id(&self.application_name, domain, options.id_discriminator()),
        };
        validate_unique_id(&unique_id).map_err(CoreError::from)?;

        let keys = options.keys();
        let bindings = options.reactive_bindings();
        for (key, _) in &bindings {
            if is_immutable_key(key) {
                return Err(CoreError::ImmutableKey {
                    unique_id,
                    key: key.clone(),
                }
                .into());
            }
            if !keys.contains(key) {
                return Err(CoreError::UnknownKey {
                    unique_id,
                    key: key.clone(),
                }
                .into());
            }
        }

        let record = EntityRecord::new(unique_id.clone(), domain, keys, options.static_values())?;
        let defaults = record.export();

        let late = {
            let mut entities = self.write();
            if let Some(existing) = entities.records.get(&unique_id) {
                error!(
                    unique_id = %unique_id,
                    domain = %domain,
                    existing_domain = %existing.domain(),
                    "Duplicate unique_id registration"
                );
                return Err(CoreError::DuplicateUniqueId {
                    unique_id,
                    domain: domain.to_string(),
                }
                .into());
            }
            entities.records.insert(unique_id.clone(), record);
            entities.order.push(unique_id.clone());
            self.is_booted()
        };

        debug!(unique_id = %unique_id, domain = %domain, name = %options.name, "Entity registered");

        for (key, binding) in bindings {
            self.reactive
                .spawn(Arc::downgrade(self), &unique_id, &key, binding);
        }

        if late {
            let registry = Arc::clone(self);
            let late_id = unique_id.clone();
            tokio::spawn(async move {
                if let Err(e) = registry.load_entity(&late_id, &defaults).await {
                    error!(unique_id = %late_id, error = %e, "Failed to load late entity");
                }
            });
        }

        Ok(StorageHandle {
            registry: Arc::clone(self),
            unique_id,
            domain,
        })
    }

    /// Handle for an already registered entity.
    pub fn handle(self: &Arc<Self>, unique_id: &str) -> Option<StorageHandle> {
        let domain = self.read().records.get(unique_id)?.domain();
        Some(StorageHandle {
            registry: Arc::clone(self),
            unique_id: unique_id.to_string(),
            domain,
        })
    }

    // =========================================================================
    // Boot
    // =========================================================================

    /// Loads every registered entity's row and merges it into memory.
    ///
    /// Returns how many entities were initialized. Storage errors abort the
    /// boot; entities already merged stay initialized.
    ///
    /// The snapshot of pending entities and the `booted` flag are taken under
    /// the entity write lock, so an entity added while boot awaits storage is
    /// loaded by `add` instead.
    pub async fn boot(&self) -> SyncResult<usize> {
        let pending: Vec<(String, Value)> = {
            let entities = self.write();
            self.booted.store(true, Ordering::Release);
            entities
                .order
                .iter()
                .filter_map(|uid| entities.records.get(uid))
                .filter(|record| !record.is_initialized())
                .map(|record| (record.unique_id().to_string(), record.export()))
                .collect()
        };

        for (unique_id, defaults) in &pending {
            self.load_entity(unique_id, defaults).await?;
        }

        info!(
            entities = pending.len(),
            backend = %self.store.backend(),
            "Storage registry booted"
        );
        Ok(pending.len())
    }

    async fn load_entity(&self, unique_id: &str, defaults: &Value) -> SyncResult<()> {
        let row = self.store.load(unique_id, defaults).await?;
        let persisted = row.state()?;

        let merged = {
            let mut entities = self.write();
            let Some(record) = entities.records.get_mut(unique_id) else {
                return Ok(());
            };
            let merged = record.merge_persisted(&persisted);
            if row.entity_id.is_some() {
                record.set_entity_id(row.entity_id.clone());
            }
            record.mark_initialized();
            merged
        };

        debug!(unique_id = %unique_id, merged, "Entity initialized from row store");

        // Reactive values computed before the merge may have been overwritten.
        self.reactive.nudge(unique_id);
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn contains(&self, unique_id: &str) -> bool {
        self.read().records.contains_key(unique_id)
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unique ids in registration order.
    pub fn unique_ids(&self) -> Vec<String> {
        self.read().order.clone()
    }

    pub fn domain_of(&self, unique_id: &str) -> Option<Domain> {
        self.read().records.get(unique_id).map(EntityRecord::domain)
    }

    pub fn get(&self, unique_id: &str, key: &str) -> Option<Value> {
        self.read().records.get(unique_id)?.get(key).cloned()
    }

    pub fn export(&self, unique_id: &str) -> Option<Value> {
        self.read().records.get(unique_id).map(EntityRecord::export)
    }

    pub fn keys(&self, unique_id: &str) -> Vec<String> {
        self.read()
            .records
            .get(unique_id)
            .map(|record| record.keys().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn is_stored(&self, unique_id: &str, key: &str) -> bool {
        self.read()
            .records
            .get(unique_id)
            .is_some_and(|record| record.is_stored(key))
    }

    pub fn is_initialized(&self, unique_id: &str) -> bool {
        self.read()
            .records
            .get(unique_id)
            .is_some_and(EntityRecord::is_initialized)
    }

    pub fn entity_id(&self, unique_id: &str) -> Option<String> {
        self.read()
            .records
            .get(unique_id)?
            .entity_id()
            .map(str::to_string)
    }

    /// Every snapshot, grouped by domain, then keyed by unique id.
    pub fn dump(&self) -> EntityDump {
        let entities = self.read();
        let mut dump = EntityDump::new();
        for record in entities.records.values() {
            dump.entry(record.domain().to_string())
                .or_default()
                .insert(record.unique_id().to_string(), record.export());
        }
        dump
    }

    /// Content hash of [`dump`](Self::dump).
    pub fn hash(&self) -> String {
        dump_hash(&self.dump())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Writes one configuration key.
    ///
    /// Completes only after the row store write (when initialized), so
    /// successive writes to one entity reach storage in order.
    pub async fn set(&self, unique_id: &str, key: &str, value: Value) -> SyncResult<()> {
        let snapshot = {
            let mut entities = self.write();
            let record = entities
                .records
                .get_mut(unique_id)
                .ok_or_else(|| CoreError::UnknownEntity(unique_id.to_string()))?;
            record.apply(key, value.clone())?;
            record.is_initialized().then(|| record.export())
        };

        match snapshot {
            Some(snapshot) => {
                self.store.update(unique_id, &snapshot).await?;

                match self.publisher() {
                    Some(publisher) if publisher.is_live() => publisher.publish(EntityChange {
                        unique_id: unique_id.to_string(),
                        key: key.to_string(),
                        value: value.clone(),
                    }),
                    _ => debug!(unique_id = %unique_id, key = %key, "Hub not live, change kept local"),
                }
            }
            None => {
                debug!(unique_id = %unique_id, key = %key, "Entity not initialized, write kept in memory");
            }
        }

        let mut patch = Map::new();
        patch.insert(key.to_string(), value);
        self.events
            .emit(unique_id, EntityEvent::Update, &Value::Object(patch));
        Ok(())
    }

    /// Records the entity id the hub assigned. Returns false for ids this
    /// process does not register.
    pub async fn confirm_entity_id(&self, unique_id: &str, entity_id: &str) -> SyncResult<bool> {
        {
            let mut entities = self.write();
            let Some(record) = entities.records.get_mut(unique_id) else {
                debug!(unique_id = %unique_id, entity_id = %entity_id, "Hub confirmed an entity we do not register");
                return Ok(false);
            };
            if record.entity_id() == Some(entity_id) {
                return Ok(true);
            }
            record.set_entity_id(Some(entity_id.to_string()));
        }

        self.store.set_entity_id(unique_id, entity_id).await?;
        info!(unique_id = %unique_id, entity_id = %entity_id, "Hub assigned entity id");
        Ok(true)
    }

    /// Stops background work. Records stay readable.
    pub fn shutdown(&self) {
        self.reactive.shutdown();
        debug!(entities = self.len(), "Storage registry stopped");
    }
}

/// Hash of a dump as sent in heartbeats and registrations.
pub fn dump_hash(dump: &EntityDump) -> String {
    let value = Value::Object(
        dump.iter()
            .map(|(domain, group)| {
                let group: Map<String, Value> = group
                    .iter()
                    .map(|(uid, snapshot)| (uid.clone(), snapshot.clone()))
                    .collect();
                (domain.clone(), Value::Object(group))
            })
            .collect(),
    );
    content_hash(&value)
}

// =============================================================================
// Storage Handle
// =============================================================================

/// Per-entity view of the registry.
#[derive(Clone)]
pub struct StorageHandle {
    registry: Arc<StorageRegistry>,
    unique_id: String,
    domain: Domain,
}

impl StorageHandle {
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.registry.get(&self.unique_id, key)
    }

    pub async fn set(&self, key: &str, value: impl Into<Value>) -> SyncResult<()> {
        self.registry.set(&self.unique_id, key, value.into()).await
    }

    /// Full snapshot as a JSON object.
    pub fn export(&self) -> Value {
        self.registry
            .export(&self.unique_id)
            .unwrap_or(Value::Null)
    }

    pub fn is_stored(&self, key: &str) -> bool {
        self.registry.is_stored(&self.unique_id, key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.registry.keys(&self.unique_id)
    }

    pub fn is_initialized(&self) -> bool {
        self.registry.is_initialized(&self.unique_id)
    }

    pub fn entity_id(&self) -> Option<String> {
        self.registry.entity_id(&self.unique_id)
    }
}

impl std::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("unique_id", &self.unique_id)
            .field("domain", &self.domain)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    use synapse_core::HubRegistration;
    use synapse_db::{
        Database, DbConfig, DbResult, EntityRow, MemoryRowStore, SqliteRowStore,
        StorageBackend, UpdateOutcome,
    };

    use crate::error::SyncError;

    /// Memory store that counts snapshot writes.
    struct CountingStore {
        inner: MemoryRowStore,
        updates: AtomicUsize,
        hold_load: AtomicBool,
        load_entered: Notify,
        load_release: Notify,
    }

    impl CountingStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryRowStore::new("home", HubRegistration::new()),
                updates: AtomicUsize::new(0),
                hold_load: AtomicBool::new(false),
                load_entered: Notify::new(),
                load_release: Notify::new(),
            })
        }

        /// Makes the next `load` wait for `load_release`.
        fn hold_next_load(&self) {
            self.hold_load.store(true, Ordering::SeqCst);
        }

        fn updates(&self) -> usize {
            self.updates.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RowStore for CountingStore {
        async fn load(&self, unique_id: &str, defaults: &Value) -> DbResult<EntityRow> {
            if self.hold_load.swap(false, Ordering::SeqCst) {
                self.load_entered.notify_one();
                self.load_release.notified().await;
            }
            self.inner.load(unique_id, defaults).await
        }
        async fn update(&self, unique_id: &str, content: &Value) -> DbResult<UpdateOutcome> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.inner.update(unique_id, content).await
        }
        async fn set_entity_id(&self, unique_id: &str, entity_id: &str) -> DbResult<()> {
            self.inner.set_entity_id(unique_id, entity_id).await
        }
        async fn load_locals(&self, unique_id: &str) -> DbResult<StdHashMap<String, Value>> {
            self.inner.load_locals(unique_id).await
        }
        async fn update_local(&self, unique_id: &str, key: &str, value: &Value) -> DbResult<()> {
            self.inner.update_local(unique_id, key, value).await
        }
        async fn delete_local(&self, unique_id: &str, key: &str) -> DbResult<()> {
            self.inner.delete_local(unique_id, key).await
        }
        async fn delete_locals_by_unique_id(&self, unique_id: &str) -> DbResult<u64> {
            self.inner.delete_locals_by_unique_id(unique_id).await
        }
        fn backend(&self) -> StorageBackend {
            StorageBackend::Memory
        }
    }

    /// Publisher that records what it was given.
    struct RecordingPublisher {
        live: AtomicBool,
        changes: Mutex<Vec<EntityChange>>,
    }

    impl ChangePublisher for RecordingPublisher {
        fn is_live(&self) -> bool {
            self.live.load(Ordering::SeqCst)
        }
        fn publish(&self, change: EntityChange) {
            self.changes.lock().unwrap().push(change);
        }
    }

    fn registry_with(store: Arc<dyn RowStore>) -> Arc<StorageRegistry> {
        StorageRegistry::new("home", store, Arc::new(EventBus::new()), Duration::from_secs(30))
    }

    fn switch(unique_id: &str) -> EntityOptions {
        EntityOptions::new(Domain::Switch, "Porch")
            .with_unique_id(unique_id)
            .with_value("is_on", false)
    }

    #[tokio::test]
    async fn test_duplicate_unique_id_keeps_first_record() {
        let registry = registry_with(CountingStore::new());

        registry.add(switch("sw1").with_value("icon", "mdi:one")).unwrap();
        let err = registry
            .add(switch("sw1").with_value("icon", "mdi:two"))
            .unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(
            err,
            SyncError::Core(CoreError::DuplicateUniqueId { .. })
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("sw1", "icon"), Some(json!("mdi:one")));
    }

    #[tokio::test]
    async fn test_derived_unique_id_is_stable() {
        let a = registry_with(CountingStore::new());
        let b = registry_with(CountingStore::new());

        let first = a.add(EntityOptions::new(Domain::Button, "Doorbell")).unwrap();
        let second = b.add(EntityOptions::new(Domain::Button, "Doorbell")).unwrap();
        assert_eq!(first.unique_id(), second.unique_id());

        let err = a.add(EntityOptions::new(Domain::Button, "Doorbell")).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_set_before_boot_stays_in_memory() {
        let store = CountingStore::new();
        let registry = registry_with(store.clone());
        let publisher = Arc::new(RecordingPublisher {
            live: AtomicBool::new(true),
            changes: Mutex::new(Vec::new()),
        });
        registry.attach_publisher(publisher.clone());

        let handle = registry.add(switch("sw1")).unwrap();
        handle.set("is_on", true).await.unwrap();

        assert_eq!(handle.get("is_on"), Some(json!(true)));
        assert!(!handle.is_initialized());
        assert_eq!(store.updates(), 0);
        assert!(publisher.changes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_after_boot_persists_full_snapshot_and_publishes() {
        let store = CountingStore::new();
        let registry = registry_with(store.clone());
        let publisher = Arc::new(RecordingPublisher {
            live: AtomicBool::new(true),
            changes: Mutex::new(Vec::new()),
        });
        registry.attach_publisher(publisher.clone());

        let handle = registry.add(switch("sw1")).unwrap();
        assert_eq!(registry.boot().await.unwrap(), 1);

        handle.set("is_on", true).await.unwrap();
        handle.set("is_on", true).await.unwrap();

        // No dirty check at this layer.
        assert_eq!(store.updates(), 2);
        let row = store.inner.row("sw1").await.unwrap();
        assert_eq!(row.state().unwrap(), handle.export());
        assert_eq!(row.state().unwrap()["is_on"], json!(true));

        let changes = publisher.changes.lock().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].key, "is_on");
        assert_eq!(changes[0].value, json!(true));
    }

    #[tokio::test]
    async fn test_set_while_not_live_persists_without_publishing() {
        let store = CountingStore::new();
        let registry = registry_with(store.clone());
        let publisher = Arc::new(RecordingPublisher {
            live: AtomicBool::new(false),
            changes: Mutex::new(Vec::new()),
        });
        registry.attach_publisher(publisher.clone());

        let handle = registry.add(switch("sw1")).unwrap();
        registry.boot().await.unwrap();
        handle.set("is_on", true).await.unwrap();

        let row = store.inner.row("sw1").await.unwrap();
        assert_eq!(row.state().unwrap()["is_on"], json!(true));
        assert!(publisher.changes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_immutable_key_rejected_for_every_domain() {
        let registry = registry_with(CountingStore::new());

        for (i, domain) in Domain::ALL.into_iter().enumerate() {
            let handle = registry
                .add(EntityOptions::new(domain, format!("Entity {}", i)).with_unique_id(format!("e{}", i)))
                .unwrap();
            let err = handle.set("translation_key", "renamed").await.unwrap_err();
            assert!(
                matches!(err, SyncError::Core(CoreError::ImmutableKey { .. })),
                "{} accepted an immutable key",
                domain
            );
        }
    }

    #[tokio::test]
    async fn test_reactive_binding_on_immutable_key_rejected() {
        let registry = registry_with(CountingStore::new());
        let err = registry
            .add(switch("sw1").with_reactive(
                "device_class",
                synapse_core::ReactiveBinding::new(|| json!("outlet")),
            ))
            .unwrap_err();

        assert!(matches!(err, SyncError::Core(CoreError::ImmutableKey { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_typed_value_is_fatal() {
        let registry = registry_with(CountingStore::new());
        let handle = registry
            .add(EntityOptions::new(Domain::Date, "Holiday").with_unique_id("d1"))
            .unwrap();

        let err = handle.set("native_value", "31/12/2024").await.unwrap_err();
        assert!(err.is_fatal());
        handle.set("native_value", "2024-12-31").await.unwrap();
    }

    #[tokio::test]
    async fn test_dump_groups_by_domain() {
        let registry = registry_with(CountingStore::new());
        registry.add(switch("sw1")).unwrap();
        registry.add(switch("sw2")).unwrap();
        registry
            .add(EntityOptions::new(Domain::Sensor, "Temp").with_unique_id("t1"))
            .unwrap();

        let dump = registry.dump();
        assert_eq!(dump.len(), 2);
        assert_eq!(dump["switch"].len(), 2);
        assert_eq!(dump["sensor"].len(), 1);
        assert_eq!(dump["switch"]["sw1"], registry.export("sw1").unwrap());
        assert!(!dump["switch"].contains_key("t1"));

        let before = registry.hash();
        assert_eq!(before, registry.hash());
        registry.set("sw1", "is_on", json!(true)).await.unwrap();
        assert_ne!(before, registry.hash());
    }

    #[tokio::test]
    async fn test_restart_restores_persisted_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synapse.db");

        {
            let db = Database::new(DbConfig::new(&path)).await.unwrap();
            let store = Arc::new(SqliteRowStore::new(db.clone(), "home", HubRegistration::new()));
            let registry = registry_with(store);
            let handle = registry.add(switch("sw1")).unwrap();
            registry.boot().await.unwrap();
            handle.set("is_on", true).await.unwrap();
            db.close().await;
        }

        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        let store = Arc::new(SqliteRowStore::new(db, "home", HubRegistration::new()));
        let registry = registry_with(store);
        let handle = registry.add(switch("sw1")).unwrap();

        // Defaults until the row has been consulted.
        assert_eq!(handle.get("is_on"), Some(json!(false)));
        registry.boot().await.unwrap();
        assert_eq!(handle.get("is_on"), Some(json!(true)));
        assert!(handle.is_initialized());
    }

    #[tokio::test]
    async fn test_entity_added_after_boot_is_loaded() {
        let store = CountingStore::new();
        let registry = registry_with(store.clone());
        registry.boot().await.unwrap();

        let handle = registry.add(switch("late")).unwrap();
        for _ in 0..50 {
            if handle.is_initialized() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(handle.is_initialized());
        assert!(store.inner.row("late").await.is_some());
    }

    #[tokio::test]
    async fn test_entity_added_while_boot_awaits_storage_is_loaded() {
        let store = CountingStore::new();
        store.hold_next_load();
        let registry = registry_with(store.clone());
        registry.add(switch("sw1")).unwrap();

        let booting = tokio::spawn({
            let registry = registry.clone();
            async move { registry.boot().await }
        });
        store.load_entered.notified().await;

        let straggler = registry.add(switch("sw2")).unwrap();
        store.load_release.notify_one();
        assert_eq!(booting.await.unwrap().unwrap(), 1);

        for _ in 0..50 {
            if straggler.is_initialized() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(registry.is_initialized("sw1"));
        assert!(straggler.is_initialized());
        assert!(store.inner.row("sw2").await.is_some());
    }

    #[tokio::test]
    async fn test_confirm_entity_id() {
        let store = CountingStore::new();
        let registry = registry_with(store.clone());
        let handle = registry.add(switch("sw1")).unwrap();
        registry.boot().await.unwrap();

        assert!(registry.confirm_entity_id("sw1", "switch.porch").await.unwrap());
        assert!(!registry.confirm_entity_id("ghost", "switch.ghost").await.unwrap());

        assert_eq!(handle.entity_id().as_deref(), Some("switch.porch"));
        let row = store.inner.row("sw1").await.unwrap();
        assert_eq!(row.entity_id.as_deref(), Some("switch.porch"));
    }

    #[tokio::test]
    async fn test_update_event_carries_patch() {
        let registry = registry_with(CountingStore::new());
        let handle = registry.add(switch("sw1")).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.events().subscribe("sw1", EntityEvent::Update, move |patch| {
            sink.lock().unwrap().push(patch.clone());
        });

        handle.set("is_on", true).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!({ "is_on": true })]);
    }
}
