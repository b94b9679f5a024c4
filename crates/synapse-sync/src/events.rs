//! # Event Bus
//!
//! Typed in-process events: per-entity events (local `update`s and hub
//! interactions such as `press`) and service calls the hub makes against
//! the app's declared services.
//!
//! ```text
//!   registry.set ──► emit(uid, Update, patch) ──┐
//!   hub entity_event ─► emit(uid, Press, data) ─┼─► listeners for (uid, event)
//!   hub service_call ─► call_service(name, data) ─► handler for name
//! ```
//!
//! Listeners run synchronously on the emitting task and must not block.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use synapse_core::EntityEvent;

use crate::protocol::ServiceDescriptor;

/// Callback invoked with the event payload.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one subscription so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Listeners {
    entity: HashMap<(String, EntityEvent), Vec<(SubscriptionId, Listener)>>,
    services: HashMap<String, (ServiceDescriptor, Listener)>,
}

/// Registry of entity event listeners and service handlers.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Listeners>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Listeners> {
        self.listeners.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Listeners> {
        self.listeners.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Entity Events
    // =========================================================================

    /// Subscribes `listener` to `event` on entity `unique_id`.
    pub fn subscribe<F>(&self, unique_id: &str, event: EntityEvent, listener: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write()
            .entity
            .entry((unique_id.to_string(), event))
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Removes one subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.write();
        let mut removed = false;
        listeners.entity.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|(sub, _)| *sub != id);
            removed |= subscribers.len() != before;
            !subscribers.is_empty()
        });
        removed
    }

    /// Drops every listener attached to `unique_id`.
    pub fn remove_entity(&self, unique_id: &str) {
        self.write().entity.retain(|(uid, _), _| uid != unique_id);
    }

    /// Invokes every listener of `(unique_id, event)`. Returns how many ran.
    pub fn emit(&self, unique_id: &str, event: EntityEvent, data: &Value) -> usize {
        // Clone out so listeners may subscribe or emit without deadlocking.
        let targets: Vec<Listener> = self
            .read()
            .entity
            .get(&(unique_id.to_string(), event))
            .map(|subscribers| subscribers.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        for listener in &targets {
            listener(data);
        }
        targets.len()
    }

    pub fn listener_count(&self, unique_id: &str, event: EntityEvent) -> usize {
        self.read()
            .entity
            .get(&(unique_id.to_string(), event))
            .map(Vec::len)
            .unwrap_or(0)
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Declares a service the hub may call. Replaces an earlier declaration
    /// of the same name.
    pub fn register_service<F>(&self, descriptor: ServiceDescriptor, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let name = descriptor.name.clone();
        if self
            .write()
            .services
            .insert(name.clone(), (descriptor, Arc::new(handler)))
            .is_some()
        {
            warn!(service = %name, "Service re-declared, replacing handler");
        }
    }

    /// Dispatches a hub service call. Returns false for unknown services.
    pub fn call_service(&self, name: &str, data: &Value) -> bool {
        let handler = self.read().services.get(name).map(|(_, h)| h.clone());
        match handler {
            Some(handler) => {
                debug!(service = %name, "Dispatching service call");
                handler(data);
                true
            }
            None => {
                warn!(service = %name, "Service call for undeclared service");
                false
            }
        }
    }

    /// Declared services, sorted by name.
    pub fn services(&self) -> Vec<ServiceDescriptor> {
        let mut services: Vec<ServiceDescriptor> = self
            .read()
            .services
            .values()
            .map(|(descriptor, _)| descriptor.clone())
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_emit_reaches_only_matching_listeners() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        bus.subscribe("btn", EntityEvent::Press, move |data| {
            sink.lock().unwrap().push(data.clone());
        });

        assert_eq!(bus.emit("btn", EntityEvent::Press, &json!({ "n": 1 })), 1);
        assert_eq!(bus.emit("btn", EntityEvent::Update, &json!({})), 0);
        assert_eq!(bus.emit("other", EntityEvent::Press, &json!({})), 0);

        assert_eq!(*seen.lock().unwrap(), vec![json!({ "n": 1 })]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe("sw1", EntityEvent::Update, |_| {});
        assert_eq!(bus.listener_count("sw1", EntityEvent::Update), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.listener_count("sw1", EntityEvent::Update), 0);
    }

    #[test]
    fn test_listener_may_emit_reentrantly() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.subscribe("a", EntityEvent::Update, move |data| {
            inner.emit("b", EntityEvent::Update, data);
        });
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        bus.subscribe("b", EntityEvent::Update, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit("a", EntityEvent::Update, &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_services() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();

        bus.register_service(
            ServiceDescriptor {
                name: "reload".into(),
                description: "Reload rules".into(),
                fields: Value::Null,
            },
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert!(bus.call_service("reload", &json!({})));
        assert!(!bus.call_service("missing", &json!({})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.services()[0].name, "reload");
    }
}
