//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     HARBOR_DEVICE_ID=register-1                                        │
//! │     HARBOR_DB_PATH=/var/lib/harbor/queue.db                            │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/harbor-sync/sync.toml (Linux)                            │
//! │     ~/Library/Application Support/com.harbor.harbor-sync/sync.toml     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     5 attempts, 120 min backoff cap, 2 h reaper, 28 day retention      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [device]
//! id = "register-1"
//! name = "Front Counter"
//!
//! [dispatch]
//! batch_size = 50
//! max_attempts = 5
//! transport_timeout_secs = 60
//!
//! [retention]
//! stale_after_secs = 7200
//! purge_after_days = 28
//!
//! [[partitions]]
//! key = "lisbon-cloud"
//! branch_id = "lisbon"
//! endpoint = "wss://sync.example.com/lisbon"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use harbor_core::backoff::DEFAULT_BACKOFF_CAP_MINUTES;
use harbor_core::PartitionKey;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier. Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Register 1", "Back Office").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "POS Terminal".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Queue database file. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: None,
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Dispatch Settings
// =============================================================================

/// Claim-and-dispatch behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Entries claimed per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Interval between dispatch cycles (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Attempts before an entry freezes in `error`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound on the retry delay (minutes).
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_minutes: u64,

    /// Bound on a single submit call. Must stay below the reaper threshold.
    #[serde(default = "default_transport_timeout")]
    pub transport_timeout_secs: u64,

    /// Concurrent workers draining each partition.
    #[serde(default = "default_workers_per_partition")]
    pub workers_per_partition: usize,
}

fn default_batch_size() -> u32 {
    50
}
fn default_poll_interval() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_cap() -> u64 {
    DEFAULT_BACKOFF_CAP_MINUTES as u64
}
fn default_transport_timeout() -> u64 {
    60
}
fn default_workers_per_partition() -> usize {
    1
}

impl Default for DispatchSettings {
    fn default() -> Self {
        DispatchSettings {
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval(),
            max_attempts: default_max_attempts(),
            backoff_cap_minutes: default_backoff_cap(),
            transport_timeout_secs: default_transport_timeout(),
            workers_per_partition: default_workers_per_partition(),
        }
    }
}

impl DispatchSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn backoff_cap(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.backoff_cap_minutes as i64)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }
}

// =============================================================================
// Retention Settings
// =============================================================================

/// Reaper and purge schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    /// Interval between retention passes (seconds).
    #[serde(default = "default_retention_interval")]
    pub interval_secs: u64,

    /// Processing entries older than this are handed back (seconds).
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Synced entries older than this are deleted (days).
    #[serde(default = "default_purge_after")]
    pub purge_after_days: u64,
}

fn default_retention_interval() -> u64 {
    300
}
fn default_stale_after() -> u64 {
    2 * 60 * 60
}
fn default_purge_after() -> u64 {
    28
}

impl Default for RetentionSettings {
    fn default() -> Self {
        RetentionSettings {
            interval_secs: default_retention_interval(),
            stale_after_secs: default_stale_after(),
            purge_after_days: default_purge_after(),
        }
    }
}

impl RetentionSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }

    pub fn purge_after(&self) -> chrono::Duration {
        chrono::Duration::days(self.purge_after_days as i64)
    }
}

// =============================================================================
// Transport Settings
// =============================================================================

/// WebSocket connection establishment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Initial backoff duration (milliseconds) between connect attempts.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (seconds) between connect attempts.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    30
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            connect_timeout_secs: default_connect_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// How long a resolved branch binding is trusted (seconds).
    #[serde(default = "default_binding_ttl")]
    pub binding_ttl_secs: u64,
}

fn default_binding_ttl() -> u64 {
    60
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            binding_ttl_secs: default_binding_ttl(),
        }
    }
}

impl CacheSettings {
    pub fn binding_ttl(&self) -> Duration {
        Duration::from_secs(self.binding_ttl_secs)
    }
}

// =============================================================================
// Partitions
// =============================================================================

/// One branch-to-remote binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSettings {
    pub key: String,
    pub branch_id: String,
    /// `ws://` or `wss://` endpoint entries of this partition are submitted to.
    pub endpoint: String,
}

impl PartitionSettings {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.key.clone())
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub dispatch: DispatchSettings,

    #[serde(default)]
    pub retention: RetentionSettings,

    #[serde(default)]
    pub transport: TransportSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub partitions: Vec<PartitionSettings>,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path).map_err(|e| {
                    SyncError::ConfigLoadFailed(format!("{}: {e}", path.display()))
                })?;
                config = Self::from_toml(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parses a TOML document without touching the environment.
    pub fn from_toml(contents: &str) -> SyncResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(format!("{}: {e}", parent.display())))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)
            .map_err(|e| SyncError::ConfigSaveFailed(format!("{}: {e}", path.display())))?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        let dispatch = &self.dispatch;
        if dispatch.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "dispatch.batch_size must be greater than 0".into(),
            ));
        }
        if dispatch.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "dispatch.max_attempts must be at least 1".into(),
            ));
        }
        if dispatch.workers_per_partition == 0 {
            return Err(SyncError::InvalidConfig(
                "dispatch.workers_per_partition must be at least 1".into(),
            ));
        }
        if dispatch.transport_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "dispatch.transport_timeout_secs must be greater than 0".into(),
            ));
        }
        // A hung submit must give up before the reaper hands its entries to
        // another worker.
        if dispatch.transport_timeout_secs >= self.retention.stale_after_secs {
            return Err(SyncError::InvalidConfig(format!(
                "dispatch.transport_timeout_secs ({}) must be shorter than retention.stale_after_secs ({})",
                dispatch.transport_timeout_secs, self.retention.stale_after_secs
            )));
        }

        let mut keys = HashSet::new();
        let mut branches = HashSet::new();
        for partition in &self.partitions {
            if partition.key.trim().is_empty() || partition.branch_id.trim().is_empty() {
                return Err(SyncError::InvalidConfig(
                    "partitions need a non-empty key and branch_id".into(),
                ));
            }
            validate_endpoint(&partition.endpoint)?;
            if !keys.insert(partition.key.as_str()) {
                return Err(SyncError::InvalidConfig(format!(
                    "duplicate partition key '{}'",
                    partition.key
                )));
            }
            if !branches.insert(partition.branch_id.as_str()) {
                return Err(SyncError::InvalidConfig(format!(
                    "branch '{}' is bound to more than one partition",
                    partition.branch_id
                )));
            }
        }

        Ok(())
    }

    /// Applies `HARBOR_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from any variable source.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("HARBOR_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(name) = lookup("HARBOR_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Some(path) = lookup("HARBOR_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = Some(PathBuf::from(path));
        }

        override_parsed(&lookup, "HARBOR_BATCH_SIZE", &mut self.dispatch.batch_size);
        override_parsed(
            &lookup,
            "HARBOR_POLL_INTERVAL_SECS",
            &mut self.dispatch.poll_interval_secs,
        );
        override_parsed(&lookup, "HARBOR_MAX_ATTEMPTS", &mut self.dispatch.max_attempts);
        override_parsed(
            &lookup,
            "HARBOR_TRANSPORT_TIMEOUT_SECS",
            &mut self.dispatch.transport_timeout_secs,
        );
        override_parsed(
            &lookup,
            "HARBOR_WORKERS_PER_PARTITION",
            &mut self.dispatch.workers_per_partition,
        );
        override_parsed(
            &lookup,
            "HARBOR_STALE_AFTER_SECS",
            &mut self.retention.stale_after_secs,
        );
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "harbor", "harbor-sync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Queue database path: configured, else the platform data directory,
    /// else the working directory.
    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.database.path {
            return path.clone();
        }
        directories::ProjectDirs::from("com", "harbor", "harbor-sync")
            .map(|dirs| dirs.data_dir().join("queue.db"))
            .unwrap_or_else(|| PathBuf::from("harbor-queue.db"))
    }

    pub fn partition(&self, key: &PartitionKey) -> Option<&PartitionSettings> {
        self.partitions.iter().find(|p| p.key == key.as_str())
    }
}

fn validate_endpoint(endpoint: &str) -> SyncResult<()> {
    let url = url::Url::parse(endpoint)?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(SyncError::InvalidUrl(format!(
            "Endpoint must use ws:// or wss://, got {other}:// in {endpoint}"
        ))),
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(name) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!(variable = name, value = %raw, "Ignoring unparsable override"),
        }
    }
}
