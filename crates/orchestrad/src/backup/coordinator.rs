//! Backup/restore fan-out across registered services
//!
//! Each service gets its own task; one failure never aborts the others.
//! The run is bracketed by `started` and `completed`/`failed` audit entries,
//! and executes on its own task so a dropped caller cannot cut it short.

use crate::audit::AuditLog;
use crate::downstream::DownstreamClient;
use crate::metrics::KernelMetrics;
use crate::registry::ServiceRegistry;
use chrono::Utc;
use orchestra_common::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const SKIPPED_UNHEALTHY: &str = "Service is unhealthy";
pub const DEFAULT_BACKUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RESTORE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_CONCURRENT_TRIGGERS: usize = 8;

const AUDIT_ENTITY: &str = "backup";

async fn trigger_one(
    client: &DownstreamClient,
    record: &ServiceRecord,
    path: &str,
    body: Option<&Value>,
    timeout: Duration,
) -> ServiceOperationResult {
    let started = Instant::now();
    let result = client.post(&record.url_for(path), body, timeout).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let (status, error) = match result {
        Ok(response) if response.status().is_success() => (OperationStatus::Success, None),
        Ok(response) => (
            OperationStatus::Failed,
            Some(format!("HTTP {}", response.status().as_u16())),
        ),
        Err(e) => (OperationStatus::Failed, Some(e.to_string())),
    };

    ServiceOperationResult {
        service_id: record.id.clone(),
        status,
        error,
        duration_ms,
    }
}

#[derive(Clone)]
pub struct BackupCoordinator {
    registry: ServiceRegistry,
    audit: AuditLog,
    client: DownstreamClient,
    metrics: KernelMetrics,
    backup_timeout: Duration,
    restore_timeout: Duration,
    max_concurrency: usize,
}

impl BackupCoordinator {
    pub fn new(
        registry: ServiceRegistry,
        audit: AuditLog,
        client: DownstreamClient,
        metrics: KernelMetrics,
    ) -> Self {
        Self {
            registry,
            audit,
            client,
            metrics,
            backup_timeout: DEFAULT_BACKUP_TIMEOUT,
            restore_timeout: DEFAULT_RESTORE_TIMEOUT,
            max_concurrency: DEFAULT_MAX_CONCURRENT_TRIGGERS,
        }
    }

    pub fn with_timeouts(mut self, backup: Duration, restore: Duration) -> Self {
        self.backup_timeout = backup;
        self.restore_timeout = restore;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Ask every (or the selected) service to back itself up.
    /// Services currently marked unhealthy are skipped.
    pub async fn trigger_backup(
        &self,
        service_ids: Option<Vec<String>>,
        actor: &Actor,
    ) -> KernelResult<FanoutRun> {
        let backup_id = Uuid::new_v4().to_string();
        self.run_detached(FanoutKind::Backup, backup_id, service_ids, actor)
            .await
    }

    /// Ask every (or the selected) service to restore `backup_id`.
    /// Unhealthy services are still attempted.
    pub async fn trigger_restore(
        &self,
        backup_id: &str,
        service_ids: Option<Vec<String>>,
        actor: &Actor,
    ) -> KernelResult<FanoutRun> {
        let backup_id = backup_id.trim();
        if backup_id.is_empty() {
            return Err(KernelError::validation("backupId must not be empty"));
        }
        self.run_detached(FanoutKind::Restore, backup_id.to_string(), service_ids, actor)
            .await
    }

    /// Spawn the run and wait for it. If the waiting caller goes away the
    /// task keeps going and still writes its closing audit entry.
    async fn run_detached(
        &self,
        kind: FanoutKind,
        backup_id: String,
        service_ids: Option<Vec<String>>,
        actor: &Actor,
    ) -> KernelResult<FanoutRun> {
        let coordinator = self.clone();
        let actor = actor.clone();
        tokio::spawn(async move { coordinator.run(kind, backup_id, service_ids, &actor).await })
            .await
            .map_err(|e| KernelError::internal(format!("{} task failed", kind.as_str()), e))?
    }

    async fn run(
        &self,
        kind: FanoutKind,
        backup_id: String,
        service_ids: Option<Vec<String>>,
        actor: &Actor,
    ) -> KernelResult<FanoutRun> {
        let (started_event, completed_event, failed_event) = match kind {
            FanoutKind::Backup => (
                AuditEventType::BackupStarted,
                AuditEventType::BackupCompleted,
                AuditEventType::BackupFailed,
            ),
            FanoutKind::Restore => (
                AuditEventType::RestoreStarted,
                AuditEventType::RestoreCompleted,
                AuditEventType::RestoreFailed,
            ),
        };
        let started_at = Utc::now();

        self.audit
            .record(
                AuditLogEntry::new(started_event, AUDIT_ENTITY, &backup_id, actor)
                    .with_details(json!({ "serviceIds": service_ids })),
            )
            .await?;
        info!("[BACKUP] {} {} started", kind.as_str(), backup_id);

        let targets = self.select_targets(service_ids).await?;
        let results = self.fan_out(kind, &backup_id, targets).await;
        let summary = FanoutSummary::from_results(&results);

        for result in &results {
            self.metrics
                .record_fanout(kind.as_str(), result.status.as_str());
        }

        let final_event = if summary.failed == 0 {
            info!(
                "[BACKUP] {} {} completed: {} succeeded, {} skipped",
                kind.as_str(),
                backup_id,
                summary.success,
                summary.skipped
            );
            completed_event
        } else {
            warn!(
                "[BACKUP] {} {} finished with {} of {} failed",
                kind.as_str(),
                backup_id,
                summary.failed,
                summary.total
            );
            failed_event
        };

        let failed_services: Vec<&str> = results
            .iter()
            .filter(|r| r.status == OperationStatus::Failed)
            .map(|r| r.service_id.as_str())
            .collect();
        self.audit
            .record(
                AuditLogEntry::new(final_event, AUDIT_ENTITY, &backup_id, actor).with_details(
                    json!({ "summary": summary, "failedServices": failed_services }),
                ),
            )
            .await?;

        Ok(FanoutRun {
            backup_id,
            kind,
            results,
            summary,
            started_at,
            completed_at: Utc::now(),
        })
    }

    async fn select_targets(
        &self,
        service_ids: Option<Vec<String>>,
    ) -> KernelResult<Vec<ServiceRecord>> {
        let records = self.registry.list_records().await?;
        let Some(wanted) = service_ids else {
            return Ok(records);
        };

        for id in &wanted {
            if !records.iter().any(|r| &r.id == id) {
                warn!("[BACKUP] Ignoring unknown service id '{}'", id);
            }
        }
        Ok(records
            .into_iter()
            .filter(|r| wanted.contains(&r.id))
            .collect())
    }

    async fn fan_out(
        &self,
        kind: FanoutKind,
        backup_id: &str,
        targets: Vec<ServiceRecord>,
    ) -> Vec<ServiceOperationResult> {
        let (path, body, timeout) = match kind {
            FanoutKind::Backup => (BACKUP_TRIGGER_PATH, None, self.backup_timeout),
            FanoutKind::Restore => (
                RESTORE_TRIGGER_PATH,
                Some(json!({ "backupId": backup_id })),
                self.restore_timeout,
            ),
        };
        let body = body.map(Arc::new);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set = JoinSet::new();
        let mut skipped = HashMap::new();

        for record in &targets {
            if kind == FanoutKind::Backup && record.status == ServiceStatus::Unhealthy {
                skipped.insert(
                    record.id.clone(),
                    ServiceOperationResult {
                        service_id: record.id.clone(),
                        status: OperationStatus::Skipped,
                        error: Some(SKIPPED_UNHEALTHY.to_string()),
                        duration_ms: 0,
                    },
                );
                continue;
            }

            let client = self.client.clone();
            let semaphore = Arc::clone(&semaphore);
            let body = body.clone();
            let record = record.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                trigger_one(&client, &record, path, body.as_deref(), timeout).await
            });
        }

        let mut finished: HashMap<String, ServiceOperationResult> = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => {
                    finished.insert(result.service_id.clone(), result);
                }
                Err(e) => warn!("[BACKUP] {} task failed: {}", kind.as_str(), e),
            }
        }

        targets
            .iter()
            .map(|record| {
                skipped
                    .remove(&record.id)
                    .or_else(|| finished.remove(&record.id))
                    .unwrap_or_else(|| ServiceOperationResult {
                        service_id: record.id.clone(),
                        status: OperationStatus::Failed,
                        error: Some("task failed".to_string()),
                        duration_ms: 0,
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::KernelDb;

    async fn coordinator(db: &KernelDb) -> BackupCoordinator {
        BackupCoordinator::new(
            ServiceRegistry::new(db.clone()),
            AuditLog::new(db.clone()),
            DownstreamClient::new().unwrap(),
            KernelMetrics::new().unwrap(),
        )
        .with_timeouts(Duration::from_secs(2), Duration::from_secs(2))
    }

    fn dead_endpoint() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_empty_registry_backup_completes() {
        let db = KernelDb::open_in_memory().await.unwrap();
        let run = coordinator(&db)
            .await
            .trigger_backup(None, &Actor::system())
            .await
            .unwrap();
        assert_eq!(run.summary.total, 0);
        assert_eq!(run.kind, FanoutKind::Backup);

        let entries = AuditLog::new(db)
            .list_entries(AuditFilter {
                entity_id: Some(run.backup_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        let events: Vec<_> = entries.iter().map(|e| e.event_type).collect();
        assert!(events.contains(&AuditEventType::BackupStarted));
        assert!(events.contains(&AuditEventType::BackupCompleted));
    }

    #[tokio::test]
    async fn test_unhealthy_skipped_on_backup_but_attempted_on_restore() {
        let db = KernelDb::open_in_memory().await.unwrap();
        let registry = ServiceRegistry::new(db.clone());
        let endpoint = dead_endpoint();
        for id in ["alpha", "beta", "gamma"] {
            registry
                .register_service(RegisterServiceInput::new(id, endpoint.clone()), &Actor::system())
                .await
                .unwrap();
        }
        registry
            .update_service_status("beta", ServiceStatus::Unhealthy, HealthObservation::default())
            .await
            .unwrap();

        let coordinator = coordinator(&db).await;
        let run = coordinator
            .trigger_backup(None, &Actor::user("ops"))
            .await
            .unwrap();
        assert_eq!(run.summary.total, 3);
        assert_eq!(run.summary.skipped, 1);
        assert_eq!(run.summary.failed, 2);
        let beta = run.results.iter().find(|r| r.service_id == "beta").unwrap();
        assert_eq!(beta.status, OperationStatus::Skipped);
        assert_eq!(beta.error.as_deref(), Some(SKIPPED_UNHEALTHY));

        let restore = coordinator
            .trigger_restore(&run.backup_id, Some(vec!["beta".to_string()]), &Actor::user("ops"))
            .await
            .unwrap();
        assert_eq!(restore.summary.total, 1);
        assert_eq!(restore.summary.skipped, 0);
        assert_eq!(restore.results[0].status, OperationStatus::Failed);

        let failed = AuditLog::new(db)
            .list_entries(AuditFilter {
                event_type: Some(AuditEventType::BackupFailed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].actor_id, "ops");
    }

    #[tokio::test]
    async fn test_restore_requires_backup_id() {
        let db = KernelDb::open_in_memory().await.unwrap();
        let err = coordinator(&db)
            .await
            .trigger_restore("  ", None, &Actor::system())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[tokio::test]
    async fn test_unknown_filter_ids_are_ignored() {
        let db = KernelDb::open_in_memory().await.unwrap();
        let run = coordinator(&db)
            .await
            .trigger_backup(Some(vec!["ghost".to_string()]), &Actor::system())
            .await
            .unwrap();
        assert!(run.results.is_empty());
    }
}
