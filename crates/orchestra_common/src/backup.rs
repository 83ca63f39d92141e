//! Backup/restore fan-out results, schedules, and kernel backup artifacts.

use crate::settings::ConfigEntry;
use crate::types::ServiceRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const BACKUP_TRIGGER_PATH: &str = "/api/backup/ops";
pub const RESTORE_TRIGGER_PATH: &str = "/api/restore/ops";
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const MAX_RETENTION_DAYS: u32 = 3650;

// ============================================================================
// Fan-out results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Failed,
    Skipped,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOperationResult {
    pub service_id: String,
    pub status: OperationStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutSummary {
    pub total: u32,
    pub success: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl FanoutSummary {
    pub fn from_results(results: &[ServiceOperationResult]) -> Self {
        let mut summary = Self::default();
        for r in results {
            summary.total += 1;
            match r.status {
                OperationStatus::Success => summary.success += 1,
                OperationStatus::Failed => summary.failed += 1,
                OperationStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutKind {
    Backup,
    Restore,
}

impl FanoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutRun {
    pub backup_id: String,
    pub kind: FanoutKind,
    pub results: Vec<ServiceOperationResult>,
    pub summary: FanoutSummary,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerBackupRequest {
    #[serde(default)]
    pub service_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRestoreRequest {
    pub backup_id: String,
    #[serde(default)]
    pub service_ids: Option<Vec<String>>,
}

// ============================================================================
// Schedules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(format!("unknown backup type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSchedule {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub backup_type: BackupType,
    pub retention_days: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

fn default_backup_type() -> BackupType {
    BackupType::Full
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduleInput {
    pub name: String,
    pub cron_expression: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_backup_type")]
    pub backup_type: BackupType,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl CreateScheduleInput {
    pub fn new(name: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cron_expression: cron_expression.into(),
            enabled: default_enabled(),
            backup_type: default_backup_type(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateScheduleInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub backup_type: Option<BackupType>,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

// ============================================================================
// Kernel backup artifacts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    /// S3-compatible object store (Cloudflare R2)
    R2,
    Local,
}

impl StorageProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::R2 => "r2",
            Self::Local => "local",
        }
    }
}

impl FromStr for StorageProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "r2" => Ok(Self::R2),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown storage provider '{}'", other)),
        }
    }
}

/// Where a stored object ended up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub object_key: String,
    pub provider: StorageProvider,
    pub local_path: Option<String>,
    /// SHA-256 (hex) of the bytes written
    pub checksum: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelBackupRecord {
    pub id: String,
    pub object: StoredObject,
    pub encrypted: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Plaintext content of a kernel backup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelSnapshot {
    pub format_version: u32,
    pub services: Vec<ServiceRecord>,
    pub configs: Vec<ConfigEntry>,
    pub schedules: Vec<BackupSchedule>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelBackupVerification {
    pub id: String,
    pub checksum_ok: bool,
    pub provider_used: StorageProvider,
    pub services: u32,
    pub configs: u32,
    pub schedules: u32,
}
