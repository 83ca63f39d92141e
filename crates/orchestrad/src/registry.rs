//! Service registry - the authoritative list of backend services
//!
//! Records are hard-deleted on unregister. Status and health fields are only
//! written by the health checker through [`write_status`].

use crate::audit::insert_entry;
use crate::db::{conflict_or_internal, json_column, KernelDb};
use chrono::{DateTime, Utc};
use orchestra_common::*;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::json;
use std::sync::LazyLock;
use tracing::{info, warn};

static SERVICE_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]{1,64}$").unwrap());

const SERVICE_COLUMNS: &str = "id, endpoint, health_check, description, version, tags, status,
     last_health_check, last_health_latency_ms, last_health_error, owner_contact,
     documentation_url, health_check_interval_ms, health_check_timeout_ms,
     registered_at, updated_at";

// ============================================================================
// Validation
// ============================================================================

pub fn validate_service_id(id: &str) -> KernelResult<()> {
    if SERVICE_ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(KernelError::validation(format!(
            "service id '{}' must be 1-{} characters of lowercase letters, digits or '-'",
            id, MAX_SERVICE_ID_LEN
        )))
    }
}

fn validate_http_url(field: &str, value: &str) -> KernelResult<()> {
    let url = reqwest::Url::parse(value)
        .map_err(|e| KernelError::validation(format!("{} '{}' is not a valid URL: {}", field, value, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(KernelError::validation(format!(
            "{} must use http or https, got '{}'",
            field, other
        ))),
    }
}

fn validate_health_path(path: &str) -> KernelResult<()> {
    if path.starts_with('/') && !path.contains(char::is_whitespace) {
        Ok(())
    } else {
        Err(KernelError::validation(format!(
            "healthCheck '{}' must be an absolute path",
            path
        )))
    }
}

fn validate_tags(tags: &[String]) -> KernelResult<()> {
    if tags.len() > MAX_SERVICE_TAGS {
        return Err(KernelError::validation(format!(
            "at most {} tags are allowed, got {}",
            MAX_SERVICE_TAGS,
            tags.len()
        )));
    }
    if let Some(bad) = tags.iter().find(|t| t.trim().is_empty() || t.len() > 64) {
        return Err(KernelError::validation(format!(
            "tag '{}' must be 1-64 characters",
            bad
        )));
    }
    Ok(())
}

fn validate_range(field: &str, value: u64, min: u64, max: u64) -> KernelResult<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(KernelError::validation(format!(
            "{} must be between {} and {}, got {}",
            field, min, max, value
        )))
    }
}

pub fn validate_registration(input: &RegisterServiceInput) -> KernelResult<()> {
    validate_service_id(&input.id)?;
    validate_http_url("endpoint", &input.endpoint)?;
    validate_health_path(&input.health_check)?;
    validate_tags(&input.tags)?;
    if let Some(url) = &input.documentation_url {
        validate_http_url("documentationUrl", url)?;
    }
    if let Some(interval) = input.health_check_interval_ms {
        validate_range(
            "healthCheckIntervalMs",
            interval,
            MIN_HEALTH_CHECK_INTERVAL_MS,
            MAX_HEALTH_CHECK_INTERVAL_MS,
        )?;
    }
    if let Some(timeout) = input.health_check_timeout_ms {
        validate_range(
            "healthCheckTimeoutMs",
            timeout,
            MIN_HEALTH_CHECK_TIMEOUT_MS,
            MAX_HEALTH_CHECK_TIMEOUT_MS,
        )?;
    }
    Ok(())
}

pub fn validate_patch(patch: &ServiceMetadataPatch) -> KernelResult<()> {
    if patch.is_empty() {
        return Err(KernelError::validation("metadata patch contains no fields"));
    }
    if let Some(tags) = &patch.tags {
        validate_tags(tags)?;
    }
    if let Some(url) = &patch.documentation_url {
        validate_http_url("documentationUrl", url)?;
    }
    if let Some(interval) = patch.health_check_interval_ms {
        validate_range(
            "healthCheckIntervalMs",
            interval,
            MIN_HEALTH_CHECK_INTERVAL_MS,
            MAX_HEALTH_CHECK_INTERVAL_MS,
        )?;
    }
    if let Some(timeout) = patch.health_check_timeout_ms {
        validate_range(
            "healthCheckTimeoutMs",
            timeout,
            MIN_HEALTH_CHECK_TIMEOUT_MS,
            MAX_HEALTH_CHECK_TIMEOUT_MS,
        )?;
    }
    Ok(())
}

// ============================================================================
// Row mapping
// ============================================================================

struct RawServiceRow {
    id: String,
    endpoint: String,
    health_check: String,
    description: Option<String>,
    version: Option<String>,
    tags: String,
    status: String,
    last_health_check: Option<DateTime<Utc>>,
    last_health_latency_ms: Option<i64>,
    last_health_error: Option<String>,
    owner_contact: Option<String>,
    documentation_url: Option<String>,
    health_check_interval_ms: i64,
    health_check_timeout_ms: i64,
    registered_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RawServiceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            endpoint: row.get(1)?,
            health_check: row.get(2)?,
            description: row.get(3)?,
            version: row.get(4)?,
            tags: row.get(5)?,
            status: row.get(6)?,
            last_health_check: row.get(7)?,
            last_health_latency_ms: row.get(8)?,
            last_health_error: row.get(9)?,
            owner_contact: row.get(10)?,
            documentation_url: row.get(11)?,
            health_check_interval_ms: row.get(12)?,
            health_check_timeout_ms: row.get(13)?,
            registered_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    fn into_record(self) -> KernelResult<ServiceRecord> {
        let status = self
            .status
            .parse::<ServiceStatus>()
            .map_err(|e| KernelError::internal("Corrupt service row", e))?;
        Ok(ServiceRecord {
            tags: json_column(&self.tags, "tags")?,
            id: self.id,
            endpoint: self.endpoint,
            health_check: self.health_check,
            description: self.description,
            version: self.version,
            status,
            last_health_check: self.last_health_check,
            last_health_latency_ms: self.last_health_latency_ms.map(|v| v.max(0) as u64),
            last_health_error: self.last_health_error,
            owner_contact: self.owner_contact,
            documentation_url: self.documentation_url,
            health_check_interval_ms: self.health_check_interval_ms.max(0) as u64,
            health_check_timeout_ms: self.health_check_timeout_ms.max(0) as u64,
            registered_at: self.registered_at,
            updated_at: self.updated_at,
        })
    }
}

pub(crate) fn load_service(conn: &Connection, id: &str) -> KernelResult<Option<ServiceRecord>> {
    let sql = format!("SELECT {} FROM services WHERE id = ?1", SERVICE_COLUMNS);
    let raw = conn
        .query_row(&sql, params![id], RawServiceRow::from_row)
        .optional()?;
    raw.map(RawServiceRow::into_record).transpose()
}

pub(crate) fn load_all_services(conn: &Connection) -> KernelResult<Vec<ServiceRecord>> {
    let sql = format!("SELECT {} FROM services ORDER BY id", SERVICE_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], RawServiceRow::from_row)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?.into_record()?);
    }
    Ok(records)
}

pub(crate) fn insert_service(conn: &Connection, record: &ServiceRecord) -> KernelResult<()> {
    write_service_row(conn, record, "INSERT")
        .map_err(|e| conflict_or_internal(e, format!("Service already registered: {}", record.id)))?;
    Ok(())
}

/// Insert or overwrite the whole row; used by kernel restore
pub(crate) fn replace_service(conn: &Connection, record: &ServiceRecord) -> KernelResult<()> {
    write_service_row(conn, record, "INSERT OR REPLACE")?;
    Ok(())
}

fn write_service_row(conn: &Connection, record: &ServiceRecord, verb: &str) -> rusqlite::Result<usize> {
    let tags = serde_json::to_string(&record.tags)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        &format!(
            "{} INTO services ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            verb, SERVICE_COLUMNS
        ),
        params![
            record.id,
            record.endpoint,
            record.health_check,
            record.description,
            record.version,
            tags,
            record.status.as_str(),
            record.last_health_check,
            record.last_health_latency_ms.map(|v| v as i64),
            record.last_health_error,
            record.owner_contact,
            record.documentation_url,
            record.health_check_interval_ms as i64,
            record.health_check_timeout_ms as i64,
            record.registered_at,
            record.updated_at,
        ],
    )
}

/// Write status and health fields. Returns false when the id is unknown.
pub(crate) fn write_status(
    conn: &Connection,
    id: &str,
    status: ServiceStatus,
    observation: &HealthObservation,
    checked_at: DateTime<Utc>,
) -> KernelResult<bool> {
    let changed = conn.execute(
        "UPDATE services
         SET status = ?2, last_health_check = ?3, last_health_latency_ms = ?4,
             last_health_error = ?5, updated_at = ?3
         WHERE id = ?1",
        params![
            id,
            status.as_str(),
            checked_at,
            observation.latency_ms.map(|v| v as i64),
            observation.error,
        ],
    )?;
    Ok(changed > 0)
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Clone)]
pub struct ServiceRegistry {
    db: KernelDb,
}

impl ServiceRegistry {
    pub fn new(db: KernelDb) -> Self {
        Self { db }
    }

    pub async fn register_service(
        &self,
        input: RegisterServiceInput,
        actor: &Actor,
    ) -> KernelResult<ServiceRecord> {
        validate_registration(&input)?;

        let now = Utc::now();
        let record = ServiceRecord {
            id: input.id,
            endpoint: input.endpoint,
            health_check: input.health_check,
            description: input.description,
            version: input.version,
            tags: input.tags,
            status: ServiceStatus::Registered,
            last_health_check: None,
            last_health_latency_ms: None,
            last_health_error: None,
            owner_contact: input.owner_contact,
            documentation_url: input.documentation_url,
            health_check_interval_ms: input
                .health_check_interval_ms
                .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
            health_check_timeout_ms: input
                .health_check_timeout_ms
                .unwrap_or(DEFAULT_HEALTH_CHECK_TIMEOUT_MS),
            registered_at: now,
            updated_at: now,
        };

        let audit = AuditLogEntry::new(AuditEventType::ServiceRegistered, "service", &record.id, actor)
            .with_details(json!({
                "endpoint": record.endpoint,
                "healthCheck": record.health_check,
                "version": record.version,
                "tags": record.tags,
            }));

        let stored = record.clone();
        self.db
            .transaction(move |tx| {
                if load_service(tx, &stored.id)?.is_some() {
                    return Err(KernelError::conflict(format!(
                        "Service already registered: {}",
                        stored.id
                    )));
                }
                insert_service(tx, &stored)?;
                insert_entry(tx, &audit)?;
                Ok(())
            })
            .await
            .map_err(|e| wrap_internal(e, "Failed to register service"))?;

        info!("[REGISTRY] Registered service {} at {}", record.id, record.endpoint);
        Ok(record)
    }

    pub async fn list_services(&self) -> KernelResult<Vec<ServiceSummary>> {
        let records = self.list_records().await?;
        Ok(records.iter().map(ServiceRecord::summary).collect())
    }

    /// Full records, ordered by id
    pub async fn list_records(&self) -> KernelResult<Vec<ServiceRecord>> {
        self.db
            .execute(load_all_services)
            .await
            .map_err(|e| wrap_internal(e, "Failed to list services"))
    }

    pub async fn get_service(&self, id: &str) -> KernelResult<ServiceRecord> {
        let key = id.to_string();
        self.db
            .execute(move |conn| load_service(conn, &key))
            .await
            .map_err(|e| wrap_internal(e, "Failed to load service"))?
            .ok_or_else(|| KernelError::not_found(format!("Service not found: {}", id)))
    }

    /// Hard delete. Returns the record as it was before removal.
    pub async fn unregister_service(&self, id: &str, actor: &Actor) -> KernelResult<ServiceRecord> {
        let key = id.to_string();
        let actor = actor.clone();
        let removed = self
            .db
            .transaction(move |tx| {
                let record = load_service(tx, &key)?
                    .ok_or_else(|| KernelError::not_found(format!("Service not found: {}", key)))?;
                tx.execute("DELETE FROM services WHERE id = ?1", params![key])?;
                let audit = AuditLogEntry::new(AuditEventType::ServiceUnregistered, "service", &key, &actor)
                    .with_previous(json!({
                        "endpoint": record.endpoint,
                        "status": record.status,
                    }));
                insert_entry(tx, &audit)?;
                Ok(record)
            })
            .await
            .map_err(|e| wrap_internal(e, "Failed to unregister service"))?;

        info!("[REGISTRY] Unregistered service {}", removed.id);
        Ok(removed)
    }

    /// Set status and health fields. Reserved for the health checker.
    pub async fn update_service_status(
        &self,
        id: &str,
        status: ServiceStatus,
        observation: HealthObservation,
    ) -> KernelResult<ServiceRecord> {
        let key = id.to_string();
        self.db
            .transaction(move |tx| {
                if !write_status(tx, &key, status, &observation, Utc::now())? {
                    return Err(KernelError::not_found(format!("Service not found: {}", key)));
                }
                load_service(tx, &key)?
                    .ok_or_else(|| KernelError::not_found(format!("Service not found: {}", key)))
            })
            .await
            .map_err(|e| wrap_internal(e, "Failed to update service status"))
    }

    /// Partial update of descriptive fields; status and health are never touched.
    pub async fn update_service_metadata(
        &self,
        id: &str,
        patch: ServiceMetadataPatch,
        actor: &Actor,
    ) -> KernelResult<ServiceRecord> {
        validate_patch(&patch)?;

        let key = id.to_string();
        let actor = actor.clone();
        let updated = self
            .db
            .transaction(move |tx| {
                let current = load_service(tx, &key)?
                    .ok_or_else(|| KernelError::not_found(format!("Service not found: {}", key)))?;

                let mut previous = serde_json::Map::new();
                let mut next = current.clone();
                if let Some(description) = patch.description {
                    previous.insert("description".into(), json!(current.description));
                    next.description = Some(description);
                }
                if let Some(version) = patch.version {
                    previous.insert("version".into(), json!(current.version));
                    next.version = Some(version);
                }
                if let Some(tags) = patch.tags {
                    previous.insert("tags".into(), json!(current.tags));
                    next.tags = tags;
                }
                if let Some(owner) = patch.owner_contact {
                    previous.insert("ownerContact".into(), json!(current.owner_contact));
                    next.owner_contact = Some(owner);
                }
                if let Some(docs) = patch.documentation_url {
                    previous.insert("documentationUrl".into(), json!(current.documentation_url));
                    next.documentation_url = Some(docs);
                }
                if let Some(interval) = patch.health_check_interval_ms {
                    previous.insert(
                        "healthCheckIntervalMs".into(),
                        json!(current.health_check_interval_ms),
                    );
                    next.health_check_interval_ms = interval;
                }
                if let Some(timeout) = patch.health_check_timeout_ms {
                    previous.insert(
                        "healthCheckTimeoutMs".into(),
                        json!(current.health_check_timeout_ms),
                    );
                    next.health_check_timeout_ms = timeout;
                }
                next.updated_at = Utc::now();

                tx.execute(
                    "UPDATE services
                     SET description = ?2, version = ?3, tags = ?4, owner_contact = ?5,
                         documentation_url = ?6, health_check_interval_ms = ?7,
                         health_check_timeout_ms = ?8, updated_at = ?9
                     WHERE id = ?1",
                    params![
                        next.id,
                        next.description,
                        next.version,
                        serde_json::to_string(&next.tags)?,
                        next.owner_contact,
                        next.documentation_url,
                        next.health_check_interval_ms as i64,
                        next.health_check_timeout_ms as i64,
                        next.updated_at,
                    ],
                )?;

                let changed: Vec<&String> = previous.keys().collect();
                let audit = AuditLogEntry::new(AuditEventType::ServiceUpdated, "service", &key, &actor)
                    .with_details(json!({ "fields": changed }))
                    .with_previous(serde_json::Value::Object(previous.clone()));
                insert_entry(tx, &audit)?;
                Ok(next)
            })
            .await
            .map_err(|e| wrap_internal(e, "Failed to update service metadata"))?;

        info!("[REGISTRY] Updated metadata for service {}", updated.id);
        Ok(updated)
    }
}

/// Keep caller-facing errors as-is; re-label internal ones with the operation.
pub(crate) fn wrap_internal(err: KernelError, operation: &str) -> KernelError {
    match err {
        KernelError::Internal { message, details } => {
            let cause = details.unwrap_or(message);
            warn!("{}: {}", operation, cause);
            KernelError::Internal {
                message: operation.to_string(),
                details: Some(cause),
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_common::AuditFilter;

    async fn registry() -> (ServiceRegistry, crate::audit::AuditLog) {
        let db = KernelDb::open_in_memory().await.unwrap();
        (ServiceRegistry::new(db.clone()), crate::audit::AuditLog::new(db))
    }

    #[test]
    fn test_service_id_format() {
        assert!(validate_service_id("billing").is_ok());
        assert!(validate_service_id("crm-v2").is_ok());
        assert!(validate_service_id("").is_err());
        assert!(validate_service_id("Billing").is_err());
        assert!(validate_service_id("a_b").is_err());
        assert!(validate_service_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_registration_validation() {
        let bad_endpoint = RegisterServiceInput::new("billing", "ftp://billing.internal");
        assert!(validate_registration(&bad_endpoint).is_err());

        let bad_path = RegisterServiceInput::new("billing", "https://billing.internal")
            .with_health_check("health");
        assert!(validate_registration(&bad_path).is_err());

        let mut too_many_tags = RegisterServiceInput::new("billing", "https://billing.internal");
        too_many_tags.tags = (0..11).map(|i| format!("t{}", i)).collect();
        assert!(validate_registration(&too_many_tags).is_err());

        let mut bad_timeout = RegisterServiceInput::new("billing", "https://billing.internal");
        bad_timeout.health_check_timeout_ms = Some(500);
        assert!(validate_registration(&bad_timeout).is_err());
    }

    #[tokio::test]
    async fn test_register_applies_defaults_and_audits() {
        let (registry, audit) = registry().await;
        let record = registry
            .register_service(
                RegisterServiceInput::new("billing", "https://billing.internal"),
                &Actor::user("alice"),
            )
            .await
            .unwrap();

        assert_eq!(record.status, ServiceStatus::Registered);
        assert_eq!(record.health_check, "/health");
        assert_eq!(record.health_check_interval_ms, DEFAULT_HEALTH_CHECK_INTERVAL_MS);
        assert_eq!(record.health_check_timeout_ms, DEFAULT_HEALTH_CHECK_TIMEOUT_MS);

        let entries = audit.list_entries(AuditFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, AuditEventType::ServiceRegistered);
        assert_eq!(entries[0].actor_id, "alice");
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts_without_mutation() {
        let (registry, audit) = registry().await;
        let actor = Actor::system();
        registry
            .register_service(RegisterServiceInput::new("billing", "https://billing.internal"), &actor)
            .await
            .unwrap();

        let err = registry
            .register_service(RegisterServiceInput::new("billing", "https://other.internal"), &actor)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let stored = registry.get_service("billing").await.unwrap();
        assert_eq!(stored.endpoint, "https://billing.internal");
        assert_eq!(audit.list_entries(AuditFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_is_hard_delete() {
        let (registry, audit) = registry().await;
        let actor = Actor::system();
        registry
            .register_service(RegisterServiceInput::new("crm", "http://crm.internal"), &actor)
            .await
            .unwrap();

        let removed = registry.unregister_service("crm", &actor).await.unwrap();
        assert_eq!(removed.endpoint, "http://crm.internal");
        assert_eq!(
            registry.get_service("crm").await.unwrap_err().code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            registry.unregister_service("crm", &actor).await.unwrap_err().code(),
            ErrorCode::NotFound
        );

        let entries = audit
            .list_entries(AuditFilter {
                event_type: Some(AuditEventType::ServiceUnregistered),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].previous_values.as_ref().unwrap()["endpoint"],
            "http://crm.internal"
        );
    }

    #[tokio::test]
    async fn test_update_status_sets_health_fields() {
        let (registry, _) = registry().await;
        registry
            .register_service(RegisterServiceInput::new("billing", "https://billing.internal"), &Actor::system())
            .await
            .unwrap();

        let updated = registry
            .update_service_status(
                "billing",
                ServiceStatus::Unhealthy,
                HealthObservation {
                    latency_ms: Some(12),
                    error: Some("HTTP 503".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, ServiceStatus::Unhealthy);
        assert_eq!(updated.last_health_latency_ms, Some(12));
        assert_eq!(updated.last_health_error.as_deref(), Some("HTTP 503"));
        assert!(updated.last_health_check.is_some());

        let err = registry
            .update_service_status("ghost", ServiceStatus::Healthy, HealthObservation::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_metadata_patch_keeps_status() {
        let (registry, audit) = registry().await;
        let actor = Actor::system();
        registry
            .register_service(RegisterServiceInput::new("billing", "https://billing.internal"), &actor)
            .await
            .unwrap();
        registry
            .update_service_status("billing", ServiceStatus::Healthy, HealthObservation::default())
            .await
            .unwrap();

        let patched = registry
            .update_service_metadata(
                "billing",
                ServiceMetadataPatch {
                    version: Some("2.1.0".to_string()),
                    tags: Some(vec!["finance".to_string()]),
                    ..Default::default()
                },
                &actor,
            )
            .await
            .unwrap();
        assert_eq!(patched.version.as_deref(), Some("2.1.0"));
        assert_eq!(patched.tags, vec!["finance".to_string()]);
        assert_eq!(patched.status, ServiceStatus::Healthy);

        let entries = audit
            .list_entries(AuditFilter {
                event_type: Some(AuditEventType::ServiceUpdated),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(entries[0].previous_values.as_ref().unwrap()["version"], serde_json::Value::Null);

        let empty = registry
            .update_service_metadata("billing", ServiceMetadataPatch::default(), &actor)
            .await
            .unwrap_err();
        assert_eq!(empty.code(), ErrorCode::Validation);
    }
}
