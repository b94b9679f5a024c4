//! # Domain Types
//!
//! Catalogue of entity domains, the keys each domain persists, and the typed
//! event kinds a domain can receive from the hub.
//!
//! ## Domain Catalogue
//! ```text
//! ┌───────────────┬──────────────────────────────────┬────────────────────────┐
//! │ Domain        │ Config keys (besides common)     │ Events                 │
//! ├───────────────┼──────────────────────────────────┼────────────────────────┤
//! │ binary_sensor │ is_on, device_class              │ -                      │
//! │ button        │ device_class                     │ press                  │
//! │ date          │ native_value (date)              │ set_value              │
//! │ datetime      │ native_value (timestamp)         │ set_value              │
//! │ lock          │ is_locked, is_jammed, ...        │ lock, unlock, open     │
//! │ number        │ native_value, native_min_value.. │ set_value              │
//! │ scene         │ -                                │ activate               │
//! │ select        │ current_option, options          │ select_option          │
//! │ sensor        │ state, last_reset (timestamp)..  │ -                      │
//! │ switch        │ is_on, device_class              │ turn_on/off, toggle    │
//! │ text          │ native_value, mode, pattern ..   │ set_value              │
//! └───────────────┴──────────────────────────────────┴────────────────────────┘
//!  Every domain also receives the local `update` event after a write.
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// =============================================================================
// Domain
// =============================================================================

/// Entity domain (the hub-side platform an entity belongs to).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    BinarySensor,
    Button,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
    Lock,
    Number,
    Scene,
    Select,
    Sensor,
    Switch,
    Text,
}

/// How a key's value is checked before it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Any JSON value.
    Any,
    Bool,
    Number,
    String,
    /// Calendar date, `YYYY-MM-DD`.
    Date,
    /// RFC 3339 timestamp.
    Timestamp,
    Object,
    StringList,
}

impl Domain {
    /// Every supported domain.
    pub const ALL: [Domain; 11] = [
        Domain::BinarySensor,
        Domain::Button,
        Domain::Date,
        Domain::DateTime,
        Domain::Lock,
        Domain::Number,
        Domain::Scene,
        Domain::Select,
        Domain::Sensor,
        Domain::Switch,
        Domain::Text,
    ];

    /// Wire name of the domain.
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::BinarySensor => "binary_sensor",
            Domain::Button => "button",
            Domain::Date => "date",
            Domain::DateTime => "datetime",
            Domain::Lock => "lock",
            Domain::Number => "number",
            Domain::Scene => "scene",
            Domain::Select => "select",
            Domain::Sensor => "sensor",
            Domain::Switch => "switch",
            Domain::Text => "text",
        }
    }

    /// Domain-specific keys persisted for entities of this domain.
    pub fn config_keys(&self) -> &'static [&'static str] {
        match self {
            Domain::BinarySensor => &["is_on", "device_class"],
            Domain::Button => &["device_class"],
            Domain::Date => &["native_value"],
            Domain::DateTime => &["native_value"],
            Domain::Lock => &[
                "changed_by",
                "code_format",
                "is_jammed",
                "is_locked",
                "is_locking",
                "is_open",
                "is_opening",
                "is_unlocking",
                "supported_features",
            ],
            Domain::Number => &[
                "device_class",
                "mode",
                "native_max_value",
                "native_min_value",
                "native_step",
                "native_unit_of_measurement",
                "native_value",
            ],
            Domain::Scene => &[],
            Domain::Select => &["current_option", "options"],
            Domain::Sensor => &[
                "device_class",
                "last_reset",
                "options",
                "state",
                "state_class",
                "suggested_display_precision",
                "unit_of_measurement",
            ],
            Domain::Switch => &["is_on", "device_class"],
            Domain::Text => &["mode", "native_max", "native_min", "native_value", "pattern"],
        }
    }

    /// Hub-initiated events this domain accepts.
    pub fn events(&self) -> &'static [EntityEvent] {
        match self {
            Domain::BinarySensor | Domain::Sensor => &[],
            Domain::Button => &[EntityEvent::Press],
            Domain::Date | Domain::DateTime | Domain::Number | Domain::Text => {
                &[EntityEvent::SetValue]
            }
            Domain::Lock => &[EntityEvent::Lock, EntityEvent::Unlock, EntityEvent::Open],
            Domain::Scene => &[EntityEvent::Activate],
            Domain::Select => &[EntityEvent::SelectOption],
            Domain::Switch => &[EntityEvent::TurnOn, EntityEvent::TurnOff, EntityEvent::Toggle],
        }
    }

    /// Key holding the entity's primary state, if the domain has one.
    pub fn state_key(&self) -> Option<&'static str> {
        match self {
            Domain::BinarySensor | Domain::Switch => Some("is_on"),
            Domain::Lock => Some("is_locked"),
            Domain::Sensor => Some("state"),
            Domain::Select => Some("current_option"),
            Domain::Date | Domain::DateTime | Domain::Number | Domain::Text => Some("native_value"),
            Domain::Button | Domain::Scene => None,
        }
    }

    /// Key whose value must be one of the entity's `options`, when set.
    pub fn option_key(&self) -> Option<&'static str> {
        match self {
            Domain::Select => Some("current_option"),
            Domain::Sensor => Some("state"),
            _ => None,
        }
    }

    /// Validation kind for `key` within this domain.
    pub fn key_kind(&self, key: &str) -> KeyKind {
        match (self, key) {
            (Domain::Date, "native_value") => KeyKind::Date,
            (Domain::DateTime, "native_value") => KeyKind::Timestamp,
            (Domain::Number, "native_value") => KeyKind::Number,
            (Domain::Text, "native_value") => KeyKind::String,
            (_, "last_reset") => KeyKind::Timestamp,
            (_, "attributes") => KeyKind::Object,
            (_, "options") => KeyKind::StringList,
            (_, "is_on" | "is_locked" | "is_locking" | "is_unlocking" | "is_jammed")
            | (_, "is_open" | "is_opening") => KeyKind::Bool,
            (_, "native_min_value" | "native_max_value" | "native_step")
            | (_, "native_min" | "native_max" | "supported_features")
            | (_, "suggested_display_precision") => KeyKind::Number,
            (_, "name" | "icon" | "entity_picture" | "entity_category")
            | (_, "translation_key" | "suggested_object_id" | "device_class")
            | (_, "current_option" | "pattern" | "mode" | "state_class") => KeyKind::String,
            _ => KeyKind::Any,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .into_iter()
            .find(|domain| domain.as_str() == s)
            .ok_or_else(|| format!("Unknown domain: {}", s))
    }
}

// =============================================================================
// Entity Events
// =============================================================================

/// Typed event kinds an entity can be subscribed to.
///
/// `Update` is emitted locally after every write; the others arrive from the
/// hub as `entity_event` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityEvent {
    Update,
    Press,
    TurnOn,
    TurnOff,
    Toggle,
    Lock,
    Unlock,
    Open,
    SetValue,
    SelectOption,
    Activate,
}

impl fmt::Display for EntityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityEvent::Update => "update",
            EntityEvent::Press => "press",
            EntityEvent::TurnOn => "turn_on",
            EntityEvent::TurnOff => "turn_off",
            EntityEvent::Toggle => "toggle",
            EntityEvent::Lock => "lock",
            EntityEvent::Unlock => "unlock",
            EntityEvent::Open => "open",
            EntityEvent::SetValue => "set_value",
            EntityEvent::SelectOption => "select_option",
            EntityEvent::Activate => "activate",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Device Info
// =============================================================================

/// Device description sent to the hub in the registration metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable device identifier (required for secondary devices).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_area: Option<String>,
}

// =============================================================================
// Hub Registration Flag
// =============================================================================

/// Shared "the hub has accepted this app" flag.
///
/// Written by the socket layer when the hub reports registration status,
/// read by the row store before it creates rows for entities it has never
/// seen.
#[derive(Debug, Clone, Default)]
pub struct HubRegistration(Arc<AtomicBool>);

impl HubRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set_registered(&self, registered: bool) {
        self.0.store(registered, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_round_trips_through_str() {
        for domain in Domain::ALL {
            assert_eq!(domain.as_str().parse::<Domain>().unwrap(), domain);
        }
        assert!("light".parse::<Domain>().is_err());
    }

    #[test]
    fn test_datetime_serializes_without_underscore() {
        let json = serde_json::to_string(&Domain::DateTime).unwrap();
        assert_eq!(json, "\"datetime\"");
    }

    #[test]
    fn test_key_kinds() {
        assert_eq!(Domain::Sensor.key_kind("last_reset"), KeyKind::Timestamp);
        assert_eq!(Domain::Date.key_kind("native_value"), KeyKind::Date);
        assert_eq!(Domain::Switch.key_kind("is_on"), KeyKind::Bool);
        assert_eq!(Domain::Sensor.key_kind("state"), KeyKind::Any);
    }

    #[test]
    fn test_state_key_is_declared() {
        for domain in Domain::ALL {
            if let Some(key) = domain.state_key() {
                assert!(domain.config_keys().contains(&key), "{} lacks {}", domain, key);
            }
        }
        assert_eq!(Domain::Button.state_key(), None);
    }

    #[test]
    fn test_switch_events() {
        assert!(Domain::Switch.events().contains(&EntityEvent::Toggle));
        assert!(Domain::Sensor.events().is_empty());
        assert_eq!(EntityEvent::SelectOption.to_string(), "select_option");
    }

    #[test]
    fn test_hub_registration_is_shared() {
        let flag = HubRegistration::new();
        let clone = flag.clone();
        assert!(!clone.is_registered());
        flag.set_registered(true);
        assert!(clone.is_registered());
    }
}
