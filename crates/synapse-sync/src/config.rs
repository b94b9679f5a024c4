//! # Synapse Configuration
//!
//! Configuration management for the agent.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     SYNAPSE_HUB_URL=ws://homeassistant.local:8123/api/synapse          │
//! │     SYNAPSE_DB_PATH=/var/lib/synapse/synapse.db                        │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/synapse/synapse.toml (Linux)                             │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     sqlite backend, 30s heartbeat, auto-generated app id               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [app]
//! name = "home_automation"
//! unique_id = "550e8400-e29b-41d4-a716-446655440000"
//! title = "Home Automation"
//!
//! [device]
//! name = "Synapse Agent"
//! manufacturer = "Digital Alchemy"
//!
//! [[secondary_devices]]
//! id = "garage"
//! name = "Garage Controller"
//!
//! [hub]
//! url = "ws://homeassistant.local:8123/api/synapse"
//! heartbeat_interval_secs = 30
//!
//! [storage]
//! backend = "sqlite"
//! database_path = "synapse.db"
//!
//! [reactive]
//! default_interval_secs = 30
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use synapse_core::DeviceInfo;
use synapse_db::{DbConfig, StorageBackend};

use crate::error::{SyncError, SyncResult};
use crate::transport::TransportConfig;

// =============================================================================
// App Configuration
// =============================================================================

/// Identity of this application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name. Stored with every row and mixed into derived ids.
    #[serde(default = "default_app_name")]
    pub name: String,

    /// Unique identity of this app instance (UUID v4).
    /// Auto-generated on first run if not provided.
    #[serde(default = "generate_app_id")]
    pub unique_id: String,

    /// Human-readable title shown by the hub.
    #[serde(default = "default_title")]
    pub title: String,

    /// Reported hostname; falls back to `$HOSTNAME`.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Reported username; falls back to `$USER`.
    #[serde(default)]
    pub username: Option<String>,
}

fn default_app_name() -> String {
    "synapse".to_string()
}

fn default_title() -> String {
    "Synapse".to_string()
}

fn generate_app_id() -> String {
    Uuid::new_v4().to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            name: default_app_name(),
            unique_id: generate_app_id(),
            title: default_title(),
            hostname: None,
            username: None,
        }
    }
}

impl AppConfig {
    pub fn hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn username(&self) -> String {
        self.username
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

// =============================================================================
// Hub Settings
// =============================================================================

/// Hub connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// WebSocket URL of the hub. `None` runs the agent offline.
    #[serde(default)]
    pub url: Option<String>,

    /// Bearer token sent with the WebSocket handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Connection timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Initial backoff duration (milliseconds) for reconnection.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (seconds) for reconnection.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Maximum reconnection attempts before giving up (0 = infinite).
    #[serde(default)]
    pub max_retries: u32,

    /// Heartbeat interval (seconds).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_heartbeat_interval() -> u64 {
    30
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings {
            url: None,
            token: None,
            connect_timeout_secs: default_connect_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_retries: 0,
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl HubSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Row store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// `sqlite` or `memory`.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_backend() -> String {
    StorageBackend::Sqlite.to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("synapse.db")
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            backend: default_backend(),
            database_path: default_database_path(),
        }
    }
}

impl StorageSettings {
    pub fn backend(&self) -> SyncResult<StorageBackend> {
        Ok(self.backend.parse::<StorageBackend>()?)
    }

    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(&self.database_path)
    }
}

// =============================================================================
// Reactive Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactiveSettings {
    /// Cadence for bindings that declare no trigger of their own (seconds).
    #[serde(default = "default_reactive_interval")]
    pub default_interval_secs: u64,
}

fn default_reactive_interval() -> u64 {
    30
}

impl Default for ReactiveSettings {
    fn default() -> Self {
        ReactiveSettings {
            default_interval_secs: default_reactive_interval(),
        }
    }
}

impl ReactiveSettings {
    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.default_interval_secs)
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynapseConfig {
    #[serde(default)]
    pub app: AppConfig,

    /// Primary device reported to the hub.
    #[serde(default = "default_device")]
    pub device: DeviceInfo,

    /// Extra devices entities may be attached to.
    #[serde(default)]
    pub secondary_devices: Vec<DeviceInfo>,

    #[serde(default)]
    pub hub: HubSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub reactive: ReactiveSettings,
}

fn default_device() -> DeviceInfo {
    DeviceInfo {
        name: "Synapse Agent".to_string(),
        manufacturer: Some("Digital Alchemy".to_string()),
        model: Some("virtual".to_string()),
        sw_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        ..Default::default()
    }
}

impl Default for SynapseConfig {
    fn default() -> Self {
        SynapseConfig {
            app: AppConfig::default(),
            device: default_device(),
            secondary_devices: Vec::new(),
            hub: HubSettings::default(),
            storage: StorageSettings::default(),
            reactive: ReactiveSettings::default(),
        }
    }
}

impl SynapseConfig {
    /// Creates a new config with defaults and a generated app id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (synapse.toml)
    /// 3. Environment variables
    ///
    /// When the file has no `app.unique_id` (or does not exist yet), the
    /// generated id is written back so the hub sees the same app after a
    /// restart. Environment overrides are not written.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();
        let mut generated_id = true;
        let path = config_path.or_else(Self::default_config_path);

        if let Some(path) = &path {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(path)?;
                let raw: toml::Value = toml::from_str(&contents)?;
                generated_id = raw
                    .get("app")
                    .and_then(|app| app.get("unique_id"))
                    .is_none();
                config = raw.try_into()?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        let persisted = config.clone();
        config.apply_env_overrides();
        config.validate()?;

        if generated_id {
            if let Some(path) = path {
                match persisted.save(Some(path)) {
                    Ok(()) => info!(unique_id = %config.app.unique_id, "Generated app identity saved"),
                    Err(e) => warn!(error = %e, "Failed to save generated app identity"),
                }
            }
        }

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.app.name.trim().is_empty() {
            return Err(SyncError::InvalidConfig("app.name must not be empty".into()));
        }

        if self.app.unique_id.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "app.unique_id must not be empty".into(),
            ));
        }

        if let Some(ref raw) = self.hub.url {
            let url = url::Url::parse(raw)?;
            if url.scheme() != "ws" && url.scheme() != "wss" {
                return Err(SyncError::InvalidUrl(format!(
                    "Hub URL must start with ws:// or wss://, got: {}",
                    raw
                )));
            }
        }

        if self.hub.heartbeat_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "heartbeat_interval_secs must be greater than 0".into(),
            ));
        }

        if self.reactive.default_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "default_interval_secs must be greater than 0".into(),
            ));
        }

        if self.storage.backend()? == StorageBackend::Sqlite
            && self.storage.database_path.as_os_str().is_empty()
        {
            return Err(SyncError::InvalidConfig(
                "database_path is required for the sqlite backend".into(),
            ));
        }

        if self.secondary_devices.iter().any(|device| device.id.is_none()) {
            return Err(SyncError::InvalidConfig(
                "every secondary device needs an id".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("SYNAPSE_APP_NAME") {
            debug!(app = %name, "Overriding app name from environment");
            self.app.name = name;
        }

        if let Ok(url) = std::env::var("SYNAPSE_HUB_URL") {
            debug!(url = %url, "Overriding hub URL from environment");
            self.hub.url = Some(url);
        }

        if let Ok(token) = std::env::var("SYNAPSE_HUB_TOKEN") {
            self.hub.token = Some(token);
        }

        if let Ok(path) = std::env::var("SYNAPSE_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.storage.database_path = PathBuf::from(path);
        }

        if let Ok(backend) = std::env::var("SYNAPSE_STORAGE_BACKEND") {
            self.storage.backend = backend;
        }

        if let Ok(secs) = std::env::var("SYNAPSE_HEARTBEAT_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) => self.hub.heartbeat_interval_secs = secs,
                Err(_) => warn!(value = %secs, "Ignoring non-numeric SYNAPSE_HEARTBEAT_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "synapse", "synapse")
            .map(|dirs| dirs.config_dir().join("synapse.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the hub URL if configured.
    pub fn hub_url(&self) -> Option<&str> {
        self.hub.url.as_deref()
    }

    /// Transport settings derived from `[hub]`.
    pub fn transport_config(&self) -> Option<TransportConfig> {
        let url = self.hub.url.clone()?;
        Some(TransportConfig {
            url,
            token: self.hub.token.clone(),
            connect_timeout: Duration::from_secs(self.hub.connect_timeout_secs),
            initial_backoff: Duration::from_millis(self.hub.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.hub.max_backoff_secs),
            max_retries: self.hub.max_retries,
            ..TransportConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SynapseConfig::default();
        assert!(!config.app.unique_id.is_empty());
        assert_eq!(config.hub.heartbeat_interval_secs, 30);
        assert_eq!(config.storage.backend().unwrap(), StorageBackend::Sqlite);
        assert!(config.validate().is_ok());
        assert!(config.transport_config().is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SynapseConfig::default();

        config.hub.url = Some("http://invalid".to_string());
        assert!(config.validate().unwrap_err().is_config_error());

        config.hub.url = Some("ws://localhost:8123/api/synapse".to_string());
        assert!(config.validate().is_ok());

        config.hub.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());

        config.hub.heartbeat_interval_secs = 30;
        config.storage.backend = "postgres".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secondary_devices_need_ids() {
        let mut config = SynapseConfig::default();
        config.secondary_devices.push(DeviceInfo {
            name: "Garage".into(),
            ..Default::default()
        });
        assert!(config.validate().is_err());

        config.secondary_devices[0].id = Some("garage".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let config: SynapseConfig = toml::from_str(
            r#"
            [app]
            name = "home"
            title = "Home"

            [hub]
            url = "wss://hub.local/api/synapse"
            heartbeat_interval_secs = 5

            [storage]
            backend = "memory"

            [[secondary_devices]]
            id = "garage"
            name = "Garage Controller"
            "#,
        )
        .unwrap();

        assert_eq!(config.app.name, "home");
        assert!(!config.app.unique_id.is_empty());
        assert_eq!(config.hub.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.storage.backend().unwrap(), StorageBackend::Memory);
        assert_eq!(config.secondary_devices.len(), 1);
        assert_eq!(config.device.name, "Synapse Agent");

        let transport = config.transport_config().unwrap();
        assert_eq!(transport.url, "wss://hub.local/api/synapse");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("synapse.toml");

        let mut config = SynapseConfig::default();
        config.app.name = "saved".into();
        config.save(Some(path.clone())).unwrap();

        let loaded = SynapseConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.app.unique_id, config.app.unique_id);
    }

    #[test]
    fn test_generated_identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synapse.toml");

        let first = SynapseConfig::load(Some(path.clone())).unwrap();
        assert!(path.exists());
        let second = SynapseConfig::load(Some(path.clone())).unwrap();
        assert_eq!(first.app.unique_id, second.app.unique_id);
    }

    #[test]
    fn test_missing_identity_is_added_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synapse.toml");
        std::fs::write(&path, "[app]\nname = \"garage\"\n").unwrap();

        let first = SynapseConfig::load(Some(path.clone())).unwrap();
        let second = SynapseConfig::load(Some(path.clone())).unwrap();
        assert_eq!(first.app.unique_id, second.app.unique_id);
        assert_eq!(second.app.name, "garage");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains(&first.app.unique_id));
    }
}
