//! # Entity Record
//!
//! The in-memory bookkeeping behind every registered entity.
//!
//! ## Invariants
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  • current_value always holds exactly the declared keys                │
//! │    (missing ones are null, unknown ones are rejected)                  │
//! │  • NO_LIVE_UPDATE keys are only ever set through `new`                 │
//! │  • initialized flips false → true once, after the persisted row has    │
//! │    been merged                                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::error::{CoreError, CoreResult};
use crate::types::Domain;
use crate::validation::{validate_option, validate_value};
use crate::is_immutable_key;

/// Storage record for one entity.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    unique_id: String,
    domain: Domain,
    keys: BTreeSet<String>,
    current_value: Map<String, Value>,
    entity_id: Option<String>,
    initialized: bool,
}

impl EntityRecord {
    /// Builds a record from its key set and static defaults.
    ///
    /// Defaults for undeclared keys fail with [`CoreError::UnknownKey`];
    /// malformed defaults fail with [`CoreError::Validation`].
    pub fn new(
        unique_id: impl Into<String>,
        domain: Domain,
        keys: impl IntoIterator<Item = String>,
        defaults: Map<String, Value>,
    ) -> CoreResult<Self> {
        let unique_id = unique_id.into();
        let keys: BTreeSet<String> = keys.into_iter().collect();

        let mut current_value: Map<String, Value> =
            keys.iter().map(|key| (key.clone(), Value::Null)).collect();

        for (key, value) in defaults {
            if !keys.contains(&key) {
                return Err(CoreError::UnknownKey { unique_id, key });
            }
            validate_value(&key, domain.key_kind(&key), &value)?;
            current_value.insert(key, value);
        }

        let record = Self {
            unique_id,
            domain,
            keys,
            current_value,
            entity_id: None,
            initialized: false,
        };
        if let Some(key) = domain.option_key() {
            let value = record.current_value.get(key).cloned().unwrap_or(Value::Null);
            record.check_option(key, &value)?;
        }
        Ok(record)
    }

    /// Rejects a value for the domain's option key that is not in `options`.
    fn check_option(&self, key: &str, value: &Value) -> CoreResult<()> {
        if self.domain.option_key() != Some(key) {
            return Ok(());
        }
        if let Some(options) = self.current_value.get("options").and_then(Value::as_array) {
            validate_option(key, value, options)?;
        }
        Ok(())
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    /// True if `key` is part of the persisted snapshot.
    pub fn is_stored(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.current_value.get(key)
    }

    /// Full snapshot as a JSON object.
    pub fn export(&self) -> Value {
        Value::Object(self.current_value.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    /// Entity id assigned by the hub, once known.
    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    pub fn set_entity_id(&mut self, entity_id: Option<String>) {
        self.entity_id = entity_id;
    }

    /// Checks that `key` may be written with `value` without touching state.
    pub fn check_write(&self, key: &str, value: &Value) -> CoreResult<()> {
        if is_immutable_key(key) {
            return Err(CoreError::ImmutableKey {
                unique_id: self.unique_id.clone(),
                key: key.to_string(),
            });
        }
        if !self.keys.contains(key) {
            return Err(CoreError::UnknownKey {
                unique_id: self.unique_id.clone(),
                key: key.to_string(),
            });
        }
        validate_value(key, self.domain.key_kind(key), value)?;
        self.check_option(key, value)?;
        Ok(())
    }

    /// Writes `value` under `key`. Returns the previous value.
    pub fn apply(&mut self, key: &str, value: Value) -> CoreResult<Value> {
        self.check_write(key, &value)?;
        Ok(self
            .current_value
            .insert(key.to_string(), value)
            .unwrap_or(Value::Null))
    }

    /// Overwrites in-memory values with a persisted snapshot.
    ///
    /// Only declared keys are taken; keys dropped from the declaration since
    /// the row was written are ignored. Returns how many keys were merged.
    pub fn merge_persisted(&mut self, persisted: &Value) -> usize {
        let Some(object) = persisted.as_object() else {
            return 0;
        };

        let mut merged = 0;
        for (key, value) in object {
            if self.keys.contains(key) {
                self.current_value.insert(key.clone(), value.clone());
                merged += 1;
            }
        }
        merged
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
