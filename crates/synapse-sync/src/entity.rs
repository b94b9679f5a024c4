//! # Virtual Entity
//!
//! Application-facing handle for one registered entity. Every read and
//! write goes through the storage registry or the locals cache; the handle
//! itself holds no state.
//!
//! ```rust,ignore
//! let porch = context.add_entity(
//!     EntityOptions::new(Domain::Switch, "Porch Light").with_value("is_on", false),
//! )?;
//!
//! porch.on(EntityEvent::TurnOn, |_| println!("hub asked to turn on"));
//! porch.set_state(true).await?;
//! porch.locals().set("last_manual_toggle", "2024-06-01T12:00:00Z").await?;
//! ```

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

use synapse_core::{CoreError, Domain, EntityEvent};

use crate::error::SyncResult;
use crate::events::{EventBus, SubscriptionId};
use crate::locals::LocalsHandle;
use crate::registry::StorageHandle;

/// One entity as seen by application code.
#[derive(Clone)]
pub struct VirtualEntity {
    storage: StorageHandle,
    locals: LocalsHandle,
    events: Arc<EventBus>,
}

impl VirtualEntity {
    pub fn new(storage: StorageHandle, locals: LocalsHandle, events: Arc<EventBus>) -> Self {
        Self {
            storage,
            locals,
            events,
        }
    }

    pub fn unique_id(&self) -> &str {
        self.storage.unique_id()
    }

    pub fn domain(&self) -> Domain {
        self.storage.domain()
    }

    /// Hub entity id, once the hub has confirmed it.
    pub fn entity_id(&self) -> Option<String> {
        self.storage.entity_id()
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    pub fn locals(&self) -> &LocalsHandle {
        &self.locals
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Primary state of the entity (`is_on`, `state`, `native_value`, ...).
    pub fn state(&self) -> Option<Value> {
        let key = self.domain().state_key()?;
        self.storage.get(key).filter(|value| !value.is_null())
    }

    pub async fn set_state(&self, value: impl Into<Value>) -> SyncResult<()> {
        let key = self.domain().state_key().ok_or_else(|| CoreError::UnknownKey {
            unique_id: self.unique_id().to_string(),
            key: "state".to_string(),
        })?;
        self.storage.set(key, value).await
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    pub fn attributes(&self) -> Map<String, Value> {
        self.storage
            .get("attributes")
            .and_then(|value| value.as_object().cloned())
            .unwrap_or_default()
    }

    /// Merges one attribute into the `attributes` object.
    pub async fn set_attribute(&self, name: &str, value: impl Into<Value>) -> SyncResult<()> {
        let mut attributes = self.attributes();
        attributes.insert(name.to_string(), value.into());
        self.storage.set("attributes", Value::Object(attributes)).await
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub fn get(&self, key: &str) -> Option<Value> {
        self.storage.get(key)
    }

    pub async fn set(&self, key: &str, value: impl Into<Value>) -> SyncResult<()> {
        self.storage.set(key, value).await
    }

    pub fn export(&self) -> Value {
        self.storage.export()
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Runs `callback` with the changed keys after every write.
    pub fn on_update<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.events
            .subscribe(self.unique_id(), EntityEvent::Update, callback)
    }

    /// Runs `callback` when the hub sends `event` for this entity.
    pub fn on<F>(&self, event: EntityEvent, callback: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if event != EntityEvent::Update && !self.domain().events().contains(&event) {
            warn!(
                unique_id = %self.unique_id(),
                domain = %self.domain(),
                event = %event,
                "Subscribed to an event this domain never receives"
            );
        }
        self.events.subscribe(self.unique_id(), event, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }
}

impl std::fmt::Debug for VirtualEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualEntity")
            .field("unique_id", &self.unique_id())
            .field("domain", &self.domain())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use synapse_core::{EntityOptions, HubRegistration};
    use synapse_db::MemoryRowStore;

    use crate::locals::LocalsCache;
    use crate::registry::StorageRegistry;

    fn entity(options: EntityOptions) -> VirtualEntity {
        let store = Arc::new(MemoryRowStore::new("home", HubRegistration::new()));
        let events = Arc::new(EventBus::new());
        let registry =
            StorageRegistry::new("home", store.clone(), events.clone(), Duration::from_secs(30));
        let locals_defaults = options.locals.clone();
        let storage = registry.add(options).unwrap();
        let locals = LocalsHandle::new(
            Arc::new(LocalsCache::new(store)),
            storage.unique_id(),
            locals_defaults,
        );
        VirtualEntity::new(storage, locals, events)
    }

    #[tokio::test]
    async fn test_state_maps_to_domain_key() {
        let lock = entity(EntityOptions::new(Domain::Lock, "Front Door").with_unique_id("lock1"));
        assert_eq!(lock.state(), None);

        lock.set_state(true).await.unwrap();
        assert_eq!(lock.get("is_locked"), Some(json!(true)));
        assert_eq!(lock.state(), Some(json!(true)));

        let button = entity(EntityOptions::new(Domain::Button, "Bell").with_unique_id("b1"));
        assert!(button.set_state(true).await.is_err());
    }

    #[tokio::test]
    async fn test_attributes_merge() {
        let sensor = entity(EntityOptions::new(Domain::Sensor, "Temp").with_unique_id("t1"));

        sensor.set_attribute("room", "kitchen").await.unwrap();
        sensor.set_attribute("floor", 1).await.unwrap();

        assert_eq!(
            Value::Object(sensor.attributes()),
            json!({ "room": "kitchen", "floor": 1 })
        );
    }

    #[tokio::test]
    async fn test_on_update_fires_for_writes() {
        let switch = entity(
            EntityOptions::new(Domain::Switch, "Porch")
                .with_unique_id("sw1")
                .with_value("is_on", false),
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = switch.on_update(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        switch.set_state(true).await.unwrap();
        assert!(switch.unsubscribe(id));
        switch.set_state(false).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_locals_use_option_defaults() {
        let switch = entity(
            EntityOptions::new(Domain::Switch, "Porch")
                .with_unique_id("sw1")
                .with_local_default("auto_off_minutes", 15),
        );

        assert_eq!(
            switch.locals().get("auto_off_minutes").await.unwrap(),
            Some(json!(15))
        );
        assert!(switch.locals().has("auto_off_minutes").await.unwrap());
    }
}
