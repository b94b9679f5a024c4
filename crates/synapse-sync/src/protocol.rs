//! # Hub Protocol Messages
//!
//! Message types exchanged with the hub over the socket.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Hub Protocol Messages                              │
//! │                                                                         │
//! │  REGISTRATION                                                          │
//! │  ────────────                                                          │
//! │  APP ───► register { app_metadata, unique_id }        (on connect)     │
//! │  HUB ───► registration_status { registered, entities }                 │
//! │  HUB ───► request_configuration {}                                     │
//! │  APP ───► update_configuration { app_metadata, unique_id }             │
//! │                                                                         │
//! │  LIVENESS                                                              │
//! │  ────────                                                              │
//! │  APP ───► heartbeat { hash }                 (fixed interval)          │
//! │  APP ───► going_offline {}                   (pre-shutdown)            │
//! │                                                                         │
//! │  STATE                                                                 │
//! │  ─────                                                                 │
//! │  APP ───► patch_entity { unique_id, data }                             │
//! │  HUB ───► entity_event { unique_id, event, data }                      │
//! │  HUB ───► service_call { service_name, service_data }                  │
//! │                                                                         │
//! │  REQUEST / RESPONSE                                                    │
//! │  ──────────────────                                                    │
//! │  APP ───► abandoned_entities { id }                                    │
//! │  HUB ───► result { id, success, result }                               │
//! │                                                                         │
//! │  ERROR                                                                 │
//! │  HUB ───► error { code, message }                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Adjacently tagged JSON; every message carries a payload object:
//! ```json
//! { "type": "heartbeat", "payload": { "hash": "9f86d0..." } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use synapse_core::{DeviceInfo, EntityEvent};

/// Snapshots grouped by domain, then keyed by unique id.
pub type EntityDump = BTreeMap<String, BTreeMap<String, Value>>;

// =============================================================================
// Main Message Enum (Tagged Union)
// =============================================================================

/// All hub protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SynapseMessage {
    // =========================================================================
    // Outbound
    // =========================================================================
    /// First registration after a connection is established.
    Register(RegisterPayload),

    /// Fresh registration in answer to `request_configuration`.
    UpdateConfiguration(RegisterPayload),

    /// Liveness beacon carrying the current configuration hash.
    Heartbeat(HeartbeatPayload),

    /// Changed keys of one entity.
    PatchEntity(PatchEntityPayload),

    /// The app is about to stop; nothing else follows.
    GoingOffline(EmptyPayload),

    /// Asks which hub-side entities no longer have a live registration.
    AbandonedEntities(RequestPayload),

    // =========================================================================
    // Inbound
    // =========================================================================
    /// Hub asks for the full configuration again.
    RequestConfiguration(EmptyPayload),

    /// Hub invoked one of the app's declared services.
    ServiceCall(ServiceCallPayload),

    /// Hub-side interaction with one entity (press, turn_on, ...).
    EntityEvent(EntityEventPayload),

    /// Whether the hub has accepted this app, plus known entity ids.
    RegistrationStatus(RegistrationStatusPayload),

    /// Answer to a request carrying the same id.
    Result(ResultPayload),

    /// Hub-reported error.
    Error(ErrorPayload),
}

// =============================================================================
// Payloads
// =============================================================================

/// Payload for messages without content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyPayload {}

/// Registration payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub app_metadata: AppMetadata,
    /// Identity of this app instance.
    pub unique_id: String,
}

/// Everything the hub needs to (re)build this app's device and entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub app: String,
    pub device: DeviceInfo,
    pub hash: String,
    pub hostname: String,
    #[serde(default)]
    pub secondary_devices: Vec<DeviceInfo>,
    #[serde(rename = "service", default)]
    pub services: Vec<ServiceDescriptor>,
    pub title: String,
    pub username: String,
    /// One key per domain holding that domain's snapshots.
    #[serde(flatten)]
    pub entities: EntityDump,
}

/// A service the app exposes to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Free-form field schema shown by the hub.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub fields: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchEntityPayload {
    pub unique_id: String,
    /// Object of changed keys to their new values.
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCallPayload {
    pub service_name: String,
    #[serde(default)]
    pub service_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEventPayload {
    pub unique_id: String,
    pub event: EntityEvent,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationStatusPayload {
    pub registered: bool,
    /// unique_id → hub entity id.
    #[serde(default)]
    pub entities: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub id: u64,
    pub success: bool,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// One entry of an `abandoned_entities` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbandonedEntity {
    pub unique_id: String,
    #[serde(default)]
    pub entity_id: Option<String>,
}

// =============================================================================
// Message Helpers
// =============================================================================

impl SynapseMessage {
    /// Returns the wire name of the message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            SynapseMessage::Register(_) => "register",
            SynapseMessage::UpdateConfiguration(_) => "update_configuration",
            SynapseMessage::Heartbeat(_) => "heartbeat",
            SynapseMessage::PatchEntity(_) => "patch_entity",
            SynapseMessage::GoingOffline(_) => "going_offline",
            SynapseMessage::AbandonedEntities(_) => "abandoned_entities",
            SynapseMessage::RequestConfiguration(_) => "request_configuration",
            SynapseMessage::ServiceCall(_) => "service_call",
            SynapseMessage::EntityEvent(_) => "entity_event",
            SynapseMessage::RegistrationStatus(_) => "registration_status",
            SynapseMessage::Result(_) => "result",
            SynapseMessage::Error(_) => "error",
        }
    }

    pub fn heartbeat(hash: impl Into<String>) -> Self {
        SynapseMessage::Heartbeat(HeartbeatPayload { hash: hash.into() })
    }

    pub fn patch_entity(unique_id: impl Into<String>, data: Value) -> Self {
        SynapseMessage::PatchEntity(PatchEntityPayload {
            unique_id: unique_id.into(),
            data,
        })
    }

    pub fn going_offline() -> Self {
        SynapseMessage::GoingOffline(EmptyPayload {})
    }

    /// Serializes the message to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes a message from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
