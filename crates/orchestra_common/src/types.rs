//! Service registry and health types shared by orchestrad and orchestractl.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/health";
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;
pub const MIN_HEALTH_CHECK_INTERVAL_MS: u64 = 5_000;
pub const MAX_HEALTH_CHECK_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_MS: u64 = 5_000;
pub const MIN_HEALTH_CHECK_TIMEOUT_MS: u64 = 1_000;
pub const MAX_HEALTH_CHECK_TIMEOUT_MS: u64 = 60_000;
pub const MAX_SERVICE_TAGS: usize = 10;
pub const MAX_SERVICE_ID_LEN: usize = 64;

// ============================================================================
// Status enums
// ============================================================================

/// Lifecycle status stored on a service record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Registered,
    Healthy,
    Degraded,
    Unhealthy,
    Unregistered,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unregistered => "unregistered",
        }
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(Self::Registered),
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "unhealthy" => Ok(Self::Unhealthy),
            "unregistered" => Ok(Self::Unregistered),
            other => Err(format!("unknown service status '{}'", other)),
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified outcome of a single health check (also the nav-facing status)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }

    /// The registry status a check outcome maps onto.
    pub fn to_service_status(self) -> ServiceStatus {
        match self {
            Self::Healthy => ServiceStatus::Healthy,
            Self::Degraded => ServiceStatus::Degraded,
            Self::Down => ServiceStatus::Unhealthy,
        }
    }

    /// Rollup of a stored registry status, used where no live ping is made.
    /// `registered` (never checked) counts as degraded.
    pub fn from_stored(status: ServiceStatus) -> Self {
        match status {
            ServiceStatus::Healthy => Self::Healthy,
            ServiceStatus::Unhealthy | ServiceStatus::Unregistered => Self::Down,
            ServiceStatus::Degraded | ServiceStatus::Registered => Self::Degraded,
        }
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "down" => Ok(Self::Down),
            other => Err(format!("unknown health status '{}'", other)),
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Service records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub id: String,
    pub endpoint: String,
    pub health_check: String,
    pub description: Option<String>,
    pub version: Option<String>,
    pub tags: Vec<String>,
    pub status: ServiceStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_health_latency_ms: Option<u64>,
    pub last_health_error: Option<String>,
    pub owner_contact: Option<String>,
    pub documentation_url: Option<String>,
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceRecord {
    /// `endpoint` joined with `path`, without doubling the slash.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    pub fn summary(&self) -> ServiceSummary {
        ServiceSummary {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            status: self.status,
            last_health_check: self.last_health_check,
        }
    }
}

/// Lightweight projection returned by `list_services`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub id: String,
    pub endpoint: String,
    pub status: ServiceStatus,
    pub last_health_check: Option<DateTime<Utc>>,
}

fn default_health_check_path() -> String {
    DEFAULT_HEALTH_CHECK_PATH.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServiceInput {
    pub id: String,
    pub endpoint: String,
    #[serde(default = "default_health_check_path")]
    pub health_check: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub owner_contact: Option<String>,
    #[serde(default)]
    pub documentation_url: Option<String>,
    #[serde(default)]
    pub health_check_interval_ms: Option<u64>,
    #[serde(default)]
    pub health_check_timeout_ms: Option<u64>,
}

impl RegisterServiceInput {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            health_check: default_health_check_path(),
            description: None,
            version: None,
            tags: Vec::new(),
            owner_contact: None,
            documentation_url: None,
            health_check_interval_ms: None,
            health_check_timeout_ms: None,
        }
    }

    pub fn with_health_check(mut self, path: impl Into<String>) -> Self {
        self.health_check = path.into();
        self
    }
}

/// Partial update of descriptive fields. Never touches status or health fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetadataPatch {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub owner_contact: Option<String>,
    #[serde(default)]
    pub documentation_url: Option<String>,
    #[serde(default)]
    pub health_check_interval_ms: Option<u64>,
    #[serde(default)]
    pub health_check_timeout_ms: Option<u64>,
}

impl ServiceMetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.version.is_none()
            && self.tags.is_none()
            && self.owner_contact.is_none()
            && self.documentation_url.is_none()
            && self.health_check_interval_ms.is_none()
            && self.health_check_timeout_ms.is_none()
    }
}

/// Health fields written alongside a status change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthObservation {
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

// ============================================================================
// Health sweep
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthHistoryEntry {
    pub id: i64,
    pub service_id: String,
    pub status: HealthStatus,
    pub latency_ms: Option<u64>,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthHistoryPage {
    pub entries: Vec<HealthHistoryEntry>,
    /// Matching entries in the window, independent of the limit
    pub total: u64,
    pub hours: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeReport {
    pub service_id: String,
    pub hours: u32,
    pub uptime_percent: f64,
    pub total_checks: u64,
    pub healthy_checks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthResult {
    pub service_id: String,
    pub status: HealthStatus,
    pub previous_status: ServiceStatus,
    pub status_changed: bool,
    pub latency_ms: Option<u64>,
    pub http_status: Option<u16>,
    pub timed_out: bool,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub healthy: u32,
    pub degraded: u32,
    pub down: u32,
    pub total: u32,
}

impl HealthSummary {
    pub fn from_statuses<I: IntoIterator<Item = HealthStatus>>(statuses: I) -> Self {
        let mut summary = Self::default();
        for status in statuses {
            match status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Down => summary.down += 1,
            }
            summary.total += 1;
        }
        summary
    }

    /// System rollup: down only when something is down and nothing is healthy.
    pub fn system_status(&self) -> HealthStatus {
        if self.down > 0 && self.healthy == 0 {
            HealthStatus::Down
        } else if self.down > 0 || self.degraded > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealthReport {
    pub status: HealthStatus,
    pub services: Vec<ServiceHealthResult>,
    pub summary: HealthSummary,
    /// Services whose check ran but could not be written to the database
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unrecorded: Vec<String>,
    pub uptime_seconds: u64,
    pub checked_at: DateTime<Utc>,
}

/// Cheap liveness check answer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessReport {
    pub status: String,
    pub database: bool,
    pub registered_services: u64,
    pub uptime_seconds: u64,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub process_rss_bytes: u64,
    pub process_virtual_bytes: u64,
    pub system_total_bytes: u64,
    pub system_used_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub health: SystemHealthReport,
    pub memory: MemoryStats,
    pub version: String,
    pub environment: String,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_totals_match() {
        let summary = HealthSummary::from_statuses([
            HealthStatus::Healthy,
            HealthStatus::Down,
            HealthStatus::Degraded,
            HealthStatus::Healthy,
        ]);
        assert_eq!(summary.total, summary.healthy + summary.degraded + summary.down);
        assert_eq!(summary.total, 4);
    }

    #[test]
    fn test_system_status_rollup() {
        let all_down = HealthSummary::from_statuses([HealthStatus::Down, HealthStatus::Down]);
        assert_eq!(all_down.system_status(), HealthStatus::Down);

        let mixed = HealthSummary::from_statuses([HealthStatus::Down, HealthStatus::Healthy]);
        assert_eq!(mixed.system_status(), HealthStatus::Degraded);

        let degraded_only = HealthSummary::from_statuses([HealthStatus::Degraded]);
        assert_eq!(degraded_only.system_status(), HealthStatus::Degraded);

        let down_and_degraded = HealthSummary::from_statuses([HealthStatus::Down, HealthStatus::Degraded]);
        assert_eq!(down_and_degraded.system_status(), HealthStatus::Down);

        assert_eq!(HealthSummary::default().system_status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_health_status_maps_to_registry_status() {
        assert_eq!(HealthStatus::Down.to_service_status(), ServiceStatus::Unhealthy);
        assert_eq!(HealthStatus::Degraded.to_service_status(), ServiceStatus::Degraded);
        assert_eq!(HealthStatus::from_stored(ServiceStatus::Registered), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_stored(ServiceStatus::Unhealthy), HealthStatus::Down);
    }

    #[test]
    fn test_url_for_trims_trailing_slash() {
        let now = Utc::now();
        let record = ServiceRecord {
            id: "billing".to_string(),
            endpoint: "https://billing.internal/".to_string(),
            health_check: "/health".to_string(),
            description: None,
            version: None,
            tags: vec![],
            status: ServiceStatus::Registered,
            last_health_check: None,
            last_health_latency_ms: None,
            last_health_error: None,
            owner_contact: None,
            documentation_url: None,
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            health_check_timeout_ms: DEFAULT_HEALTH_CHECK_TIMEOUT_MS,
            registered_at: now,
            updated_at: now,
        };
        assert_eq!(record.url_for("/health"), "https://billing.internal/health");
    }

    #[test]
    fn test_register_input_defaults_health_path() {
        let input: RegisterServiceInput =
            serde_json::from_str(r#"{"id":"billing","endpoint":"https://billing.internal"}"#).unwrap();
        assert_eq!(input.health_check, "/health");
        assert!(input.tags.is_empty());
    }
}
