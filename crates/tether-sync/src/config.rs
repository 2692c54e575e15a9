//! # Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TETHER_NAMESPACE=fitquest                                          │
//! │     TETHER_DB_PATH=/data/tether.db                                     │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tether/tether.toml (Linux)                               │
//! │     ~/Library/Application Support/com.tether.tether/tether.toml        │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [app]
//! namespace = "fitquest"
//! database_path = "/var/lib/fitquest/tether.db"
//!
//! [cache]
//! default_ttl_secs = 300
//! profile_ttl_secs = 600
//! challenge_ttl_secs = 300
//! activity_ttl_secs = 120
//!
//! [sync]
//! max_attempts = 5
//! initial_backoff_ms = 500
//! max_backoff_secs = 30
//! remote_timeout_secs = 15
//! retry_poll_interval_secs = 30
//! sync_on_startup = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use tether_core::SyncTable;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// App Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Cache key namespace (`<namespace>/cache/...`).
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

fn default_namespace() -> String {
    "tether".to_string()
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            namespace: default_namespace(),
            database_path: None,
        }
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

/// Time-to-live per entity, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,

    #[serde(default = "default_profile_ttl")]
    pub profile_ttl_secs: u64,

    #[serde(default = "default_ttl")]
    pub challenge_ttl_secs: u64,

    #[serde(default = "default_activity_ttl")]
    pub activity_ttl_secs: u64,
}

fn default_ttl() -> u64 {
    300
}
fn default_profile_ttl() -> u64 {
    600
}
fn default_activity_ttl() -> u64 {
    120
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            default_ttl_secs: default_ttl(),
            profile_ttl_secs: default_profile_ttl(),
            challenge_ttl_secs: default_ttl(),
            activity_ttl_secs: default_activity_ttl(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Failures before a retryable error becomes terminal.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff base: delay = min(max_backoff, 2^attempts * initial_backoff).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Upper bound on any single remote call.
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_secs: u64,

    /// How often the background worker looks for due retries.
    #[serde(default = "default_retry_poll_interval")]
    pub retry_poll_interval_secs: u64,

    /// Drain the queue during `initialize()` when online.
    #[serde(default = "default_true")]
    pub sync_on_startup: bool,
}

fn default_max_attempts() -> u32 {
    tether_core::MAX_SYNC_ATTEMPTS
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    30
}
fn default_remote_timeout() -> u64 {
    15
}
fn default_retry_poll_interval() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            remote_timeout_secs: default_remote_timeout(),
            retry_poll_interval_secs: default_retry_poll_interval(),
            sync_on_startup: true,
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete configuration for the cache and sync engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub app: AppSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub sync: SyncSettings,
}

impl TetherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tether.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

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

    pub fn validate(&self) -> SyncResult<()> {
        let namespace = self.app.namespace.trim();
        if namespace.is_empty() || namespace.contains('/') {
            return Err(SyncError::InvalidConfig(format!(
                "namespace must be non-empty and contain no '/', got: '{}'",
                self.app.namespace
            )));
        }

        if self.sync.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_attempts must be greater than 0".into(),
            ));
        }

        if self.sync.initial_backoff_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "initial_backoff_ms must be greater than 0".into(),
            ));
        }

        if self.sync.remote_timeout_secs == 0 || self.sync.retry_poll_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "remote_timeout_secs and retry_poll_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies `TETHER_*` overrides read through `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ns) = lookup("TETHER_NAMESPACE") {
            debug!(namespace = %ns, "Overriding namespace from environment");
            self.app.namespace = ns;
        }

        if let Some(path) = lookup("TETHER_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.app.database_path = Some(PathBuf::from(path));
        }

        let parse_u64 = |name: &str| -> Option<u64> {
            let raw = lookup(name)?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(var = name, value = %raw, "Ignoring non-numeric environment override");
                    None
                }
            }
        };

        if let Some(v) = parse_u64("TETHER_DEFAULT_TTL_SECS") {
            self.cache.default_ttl_secs = v;
        }
        if let Some(v) = parse_u64("TETHER_MAX_ATTEMPTS") {
            self.sync.max_attempts = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = parse_u64("TETHER_REMOTE_TIMEOUT_SECS") {
            self.sync.remote_timeout_secs = v;
        }
        if let Some(v) = parse_u64("TETHER_RETRY_POLL_SECS") {
            self.sync.retry_poll_interval_secs = v;
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("tether.toml"))
    }

    /// Configured database path, or `tether.db` in the platform data directory.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.app
            .database_path
            .clone()
            .or_else(|| Self::project_dirs().map(|dirs| dirs.data_dir().join("tether.db")))
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "tether", "tether")
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Cache TTL for rows of `table`.
    pub fn ttl_for(&self, table: SyncTable) -> Duration {
        let secs = match table {
            SyncTable::Profiles => self.cache.profile_ttl_secs,
            SyncTable::Challenges => self.cache.challenge_ttl_secs,
            SyncTable::Activities => self.cache.activity_ttl_secs,
            SyncTable::ChallengeParticipants => self.cache.default_ttl_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.remote_timeout_secs)
    }

    pub fn retry_poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync.retry_poll_interval_secs)
    }
}
