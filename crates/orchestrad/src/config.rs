//! Configuration management for orchestrad.
//!
//! Loads settings from /etc/orchestra/kernel.toml (or `ORCHESTRA_CONFIG`),
//! then applies environment overrides. Missing files fall back to defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/orchestra/kernel.toml";

/// Environment variable pointing at an alternative config file
pub const CONFIG_PATH_ENV: &str = "ORCHESTRA_CONFIG";

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Whole-request timeout in seconds; must exceed the restore trigger timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_body_limit")]
    pub max_body_bytes: usize,
}

fn default_bind() -> String {
    "127.0.0.1:7870".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_secs: default_request_timeout(),
            max_body_bytes: default_body_limit(),
        }
    }
}

/// Database and local backup locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/orchestra/kernel.db")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/var/lib/orchestra/backups")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            backup_dir: default_backup_dir(),
        }
    }
}

/// Health sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// When set, used for every check instead of each service's own timeout
    #[serde(default)]
    pub check_timeout_ms: Option<u64>,

    #[serde(default = "default_health_concurrency")]
    pub max_concurrent_checks: usize,
}

fn default_health_concurrency() -> usize {
    16
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_timeout_ms: None,
            max_concurrent_checks: default_health_concurrency(),
        }
    }
}

/// Navigation aggregation and circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavConfig {
    #[serde(default = "default_manifest_timeout")]
    pub manifest_timeout_ms: u64,

    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    #[serde(default = "default_breaker_reset")]
    pub breaker_reset_secs: u64,

    #[serde(default = "default_manifest_concurrency")]
    pub max_concurrent_fetches: usize,
}

fn default_manifest_timeout() -> u64 {
    5_000
}

fn default_breaker_threshold() -> u32 {
    3
}

fn default_breaker_reset() -> u64 {
    60
}

fn default_manifest_concurrency() -> usize {
    16
}

impl Default for NavConfig {
    fn default() -> Self {
        Self {
            manifest_timeout_ms: default_manifest_timeout(),
            breaker_threshold: default_breaker_threshold(),
            breaker_reset_secs: default_breaker_reset(),
            max_concurrent_fetches: default_manifest_concurrency(),
        }
    }
}

/// Backup/restore fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_trigger_timeout")]
    pub trigger_timeout_secs: u64,

    #[serde(default = "default_restore_timeout")]
    pub restore_timeout_secs: u64,

    #[serde(default = "default_trigger_concurrency")]
    pub max_concurrent_triggers: usize,

    /// Timeout for each primary object store request
    #[serde(default = "default_object_store_timeout")]
    pub object_store_timeout_secs: u64,
}

fn default_trigger_timeout() -> u64 {
    30
}

fn default_restore_timeout() -> u64 {
    60
}

fn default_trigger_concurrency() -> usize {
    8
}

fn default_object_store_timeout() -> u64 {
    60
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            trigger_timeout_secs: default_trigger_timeout(),
            restore_timeout_secs: default_restore_timeout(),
            max_concurrent_triggers: default_trigger_concurrency(),
            object_store_timeout_secs: default_object_store_timeout(),
        }
    }
}

fn default_environment() -> String {
    "development".to_string()
}

/// Full kernel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub nav: NavConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            health: HealthConfig::default(),
            nav: NavConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Load config from file, or return defaults; then apply env overrides
    pub fn load() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| CONFIG_PATH.to_string());
        let mut config = Self::load_from_path(&path).unwrap_or_else(|e| {
            warn!("[BOOT] Config not loaded from {}, using defaults: {:#}", path, e);
            KernelConfig::default()
        });
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Load config from specific path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: KernelConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        info!("[BOOT] Loaded config from {}", path.display());
        Ok(config)
    }

    /// `lookup` is `std::env::var` in production and a map in tests
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(bind) = value("ORCHESTRA_BIND") {
            self.server.bind = bind;
        }
        if let Some(path) = value("ORCHESTRA_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(dir) = value("ORCHESTRA_BACKUP_DIR") {
            self.storage.backup_dir = PathBuf::from(dir);
        }
        if let Some(env) = value("ORCHESTRA_ENV") {
            self.environment = env;
        }
    }

    pub fn health_timeout_override(&self) -> Option<Duration> {
        self.health.check_timeout_ms.map(Duration::from_millis)
    }

    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_millis(self.nav.manifest_timeout_ms)
    }

    pub fn breaker_reset(&self) -> Duration {
        Duration::from_secs(self.nav.breaker_reset_secs)
    }

    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_secs(self.backup.trigger_timeout_secs)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.backup.restore_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}
