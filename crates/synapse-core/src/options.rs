//! # Entity Options
//!
//! What an application hands over when it registers an entity: the domain,
//! a display name, an optional explicit id, the initial configuration and
//! the locals defaults.
//!
//! ## Config Values
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ConfigValue::Static(json)        copied into the record at creation   │
//! │                                                                         │
//! │  ConfigValue::Reactive(binding)   record starts at null; a scheduler   │
//! │     ├── compute: Fn() -> Value    evaluates the binding immediately,   │
//! │     ├── interval: Option<Dur>     then on every interval tick and on   │
//! │     └── depends_on: [unique_id]   every update of a dependency         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::types::Domain;
use crate::COMMON_KEYS;

// =============================================================================
// Reactive Binding
// =============================================================================

/// Pure function producing the next value of a reactive key.
pub type ComputeFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// A computed configuration value.
///
/// When neither an interval nor dependencies are given, the binding runs on
/// the scheduler's default cadence.
#[derive(Clone)]
pub struct ReactiveBinding {
    compute: ComputeFn,
    interval: Option<Duration>,
    depends_on: Vec<String>,
}

impl ReactiveBinding {
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self {
            compute: Arc::new(compute),
            interval: None,
            depends_on: Vec::new(),
        }
    }

    /// Re-evaluate on a fixed cadence.
    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Re-evaluate whenever the entity `unique_id` is updated.
    pub fn on_update_of(mut self, unique_id: impl Into<String>) -> Self {
        self.depends_on.push(unique_id.into());
        self
    }

    pub fn compute(&self) -> Value {
        (self.compute)()
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    /// True when the binding has no trigger of its own.
    pub fn uses_default_cadence(&self) -> bool {
        self.interval.is_none() && self.depends_on.is_empty()
    }
}

impl fmt::Debug for ReactiveBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveBinding")
            .field("interval", &self.interval)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

/// Either a static value or a reactive binding.
#[derive(Debug, Clone)]
pub enum ConfigValue {
    Static(Value),
    Reactive(ReactiveBinding),
}

impl From<Value> for ConfigValue {
    fn from(value: Value) -> Self {
        ConfigValue::Static(value)
    }
}

impl From<ReactiveBinding> for ConfigValue {
    fn from(binding: ReactiveBinding) -> Self {
        ConfigValue::Reactive(binding)
    }
}

// =============================================================================
// Entity Options
// =============================================================================

/// Registration options for one entity.
///
/// ## Example
/// ```rust
/// use std::time::Duration;
/// use serde_json::json;
/// use synapse_core::{Domain, EntityOptions, ReactiveBinding};
///
/// let options = EntityOptions::new(Domain::Sensor, "Outdoor Temperature")
///     .with_value("unit_of_measurement", "°C")
///     .with_reactive(
///         "state",
///         ReactiveBinding::new(|| json!(21.5)).every(Duration::from_secs(60)),
///     )
///     .with_local_default("calibration", 0.0);
///
/// assert!(options.keys().contains(&"state".to_string()));
/// assert_eq!(options.reactive_bindings().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct EntityOptions {
    pub domain: Domain,
    pub name: String,
    pub unique_id: Option<String>,
    pub suggested_object_id: Option<String>,
    pub config: BTreeMap<String, ConfigValue>,
    pub locals: Map<String, Value>,
    extra_keys: Vec<String>,
}

impl EntityOptions {
    pub fn new(domain: Domain, name: impl Into<String>) -> Self {
        Self {
            domain,
            name: name.into(),
            unique_id: None,
            suggested_object_id: None,
            config: BTreeMap::new(),
            locals: Map::new(),
            extra_keys: Vec::new(),
        }
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_suggested_object_id(mut self, object_id: impl Into<String>) -> Self {
        self.suggested_object_id = Some(object_id.into());
        self
    }

    /// Static initial value for `key`.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config
            .insert(key.into(), ConfigValue::Static(value.into()));
        self
    }

    /// Reactive binding for `key`.
    pub fn with_reactive(mut self, key: impl Into<String>, binding: ReactiveBinding) -> Self {
        self.config
            .insert(key.into(), ConfigValue::Reactive(binding));
        self
    }

    /// Code default for a local key. Never written to storage.
    pub fn with_local_default(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.locals.insert(key.into(), value.into());
        self
    }

    /// Persist an extra key outside the domain catalogue.
    pub fn with_extra_key(mut self, key: impl Into<String>) -> Self {
        self.extra_keys.push(key.into());
        self
    }

    /// Full persisted key set: domain keys, extra keys and common keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .domain
            .config_keys()
            .iter()
            .chain(COMMON_KEYS.iter())
            .map(|key| key.to_string())
            .chain(self.extra_keys.iter().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Static values to copy into the record, including `name` and
    /// `suggested_object_id`.
    pub fn static_values(&self) -> Map<String, Value> {
        let mut values = Map::new();
        values.insert("name".to_string(), Value::String(self.name.clone()));
        if let Some(object_id) = &self.suggested_object_id {
            values.insert(
                "suggested_object_id".to_string(),
                Value::String(object_id.clone()),
            );
        }
        for (key, value) in &self.config {
            if let ConfigValue::Static(value) = value {
                values.insert(key.clone(), value.clone());
            }
        }
        values
    }

    pub fn reactive_bindings(&self) -> Vec<(String, ReactiveBinding)> {
        self.config
            .iter()
            .filter_map(|(key, value)| match value {
                ConfigValue::Reactive(binding) => Some((key.clone(), binding.clone())),
                ConfigValue::Static(_) => None,
            })
            .collect()
    }

    /// Discriminator used for id derivation.
    pub fn id_discriminator(&self) -> &str {
        self.suggested_object_id.as_deref().unwrap_or(&self.name)
    }
}
