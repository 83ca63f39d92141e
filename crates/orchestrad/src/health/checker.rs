//! Health sweep: ping every registered service, record the outcome, roll up

use crate::audit::insert_entry;
use crate::db::KernelDb;
use crate::downstream::DownstreamClient;
use crate::health::history::insert_history;
use crate::metrics::KernelMetrics;
use crate::registry::{write_status, ServiceRegistry};
use chrono::{DateTime, Utc};
use orchestra_common::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Map an HTTP status code onto a health classification
pub fn classify_http_status(code: u16) -> HealthStatus {
    match code {
        200..=299 => HealthStatus::Healthy,
        500..=599 => HealthStatus::Down,
        _ => HealthStatus::Degraded,
    }
}

/// What one ping produced, before anything is persisted
#[derive(Debug, Clone)]
pub(crate) struct CheckOutcome {
    pub status: HealthStatus,
    pub latency_ms: Option<u64>,
    pub http_status: Option<u16>,
    pub timed_out: bool,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl CheckOutcome {
    fn task_failed(reason: &str) -> Self {
        Self {
            status: HealthStatus::Down,
            latency_ms: None,
            http_status: None,
            timed_out: false,
            error: Some(format!("Health check task failed: {}", reason)),
            checked_at: Utc::now(),
        }
    }
}

pub(crate) async fn check_service(
    client: &DownstreamClient,
    record: &ServiceRecord,
    timeout: Duration,
) -> CheckOutcome {
    let url = record.url_for(&record.health_check);
    let started = Instant::now();
    let result = client.get(&url, timeout).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(response) => {
            let code = response.status().as_u16();
            let status = classify_http_status(code);
            CheckOutcome {
                status,
                latency_ms: Some(elapsed_ms),
                http_status: Some(code),
                timed_out: false,
                error: (status != HealthStatus::Healthy).then(|| format!("HTTP {}", code)),
                checked_at: Utc::now(),
            }
        }
        Err(err) => CheckOutcome {
            status: HealthStatus::Down,
            latency_ms: None,
            http_status: None,
            timed_out: err.is_timeout(),
            error: Some(err.to_string()),
            checked_at: Utc::now(),
        },
    }
}

pub struct HealthChecker {
    db: KernelDb,
    registry: ServiceRegistry,
    client: DownstreamClient,
    metrics: KernelMetrics,
    started_at: Instant,
    max_concurrency: usize,
    timeout_override: Option<Duration>,
    environment: String,
}

impl HealthChecker {
    pub fn new(
        db: KernelDb,
        client: DownstreamClient,
        metrics: KernelMetrics,
        started_at: Instant,
    ) -> Self {
        Self {
            registry: ServiceRegistry::new(db.clone()),
            db,
            client,
            metrics,
            started_at,
            max_concurrency: 16,
            timeout_override: None,
            environment: "development".to_string(),
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Apply one timeout to every check instead of each service's own
    pub fn with_timeout_override(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_override = timeout;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub(crate) fn environment(&self) -> &str {
        &self.environment
    }

    pub(crate) fn db(&self) -> &KernelDb {
        &self.db
    }

    /// Ping every registered service concurrently and persist the outcomes.
    ///
    /// `timeout` wins over the configured override, which wins over the
    /// per-service `healthCheckTimeoutMs`.
    pub async fn check_all_service_health(
        &self,
        timeout: Option<Duration>,
    ) -> KernelResult<SystemHealthReport> {
        let records = self.registry.list_records().await?;
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set = JoinSet::new();

        for record in records.iter().cloned() {
            let client = self.client.clone();
            let semaphore = Arc::clone(&semaphore);
            let budget = timeout
                .or(self.timeout_override)
                .unwrap_or_else(|| Duration::from_millis(record.health_check_timeout_ms));

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = check_service(&client, &record, budget).await;
                (record.id, outcome)
            });
        }

        let mut outcomes: HashMap<String, CheckOutcome> = HashMap::with_capacity(records.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((id, outcome)) => {
                    outcomes.insert(id, outcome);
                }
                Err(e) => warn!("[HEALTH] Health check task failed: {}", e),
            }
        }

        let mut results = Vec::with_capacity(records.len());
        let mut unrecorded = Vec::new();
        for record in &records {
            let outcome = outcomes
                .remove(&record.id)
                .unwrap_or_else(|| CheckOutcome::task_failed("task did not complete"));
            self.metrics.record_health_check(
                &record.id,
                outcome.status.as_str(),
                outcome.latency_ms.unwrap_or(0) as f64 / 1000.0,
            );
            if let Err(e) = self.record_outcome(record, &outcome).await {
                warn!("[HEALTH] Could not record check for {}: {}", record.id, e);
                unrecorded.push(record.id.clone());
            }
            results.push(health_result(record, outcome));
        }

        let summary = HealthSummary::from_statuses(results.iter().map(|r| r.status));
        let status = summary.system_status();
        self.metrics.update_sweep(records.len(), status);

        debug!(
            "[HEALTH] Sweep complete: {} healthy, {} degraded, {} down, {} unrecorded",
            summary.healthy,
            summary.degraded,
            summary.down,
            unrecorded.len()
        );

        Ok(SystemHealthReport {
            status,
            services: results,
            summary,
            unrecorded,
            uptime_seconds: self.uptime_seconds(),
            checked_at: Utc::now(),
        })
    }

    /// Persist one outcome: status change + audit only on transition, history always.
    async fn record_outcome(&self, record: &ServiceRecord, outcome: &CheckOutcome) -> KernelResult<()> {
        let previous = record.status;
        let next = outcome.status.to_service_status();
        let changed = next != previous;

        if changed {
            if outcome.status == HealthStatus::Down {
                warn!(
                    "[HEALTH] {} {} -> {} ({})",
                    record.id,
                    previous,
                    next,
                    outcome.error.as_deref().unwrap_or("no error")
                );
            } else {
                info!("[HEALTH] {} {} -> {}", record.id, previous, next);
            }
        }

        let service_id = record.id.clone();
        let persisted = outcome.clone();
        self.db
            .transaction(move |tx| {
                if changed {
                    let observation = HealthObservation {
                        latency_ms: persisted.latency_ms,
                        error: persisted.error.clone(),
                    };
                    // The service may have been unregistered mid-sweep
                    if write_status(tx, &service_id, next, &observation, persisted.checked_at)? {
                        let audit = AuditLogEntry::new(
                            AuditEventType::ServiceHealthChanged,
                            "service",
                            &service_id,
                            &Actor::system(),
                        )
                        .with_details(json!({
                            "previousStatus": previous,
                            "newStatus": next,
                            "latencyMs": persisted.latency_ms,
                            "error": persisted.error,
                        }))
                        .with_previous(json!({ "status": previous }));
                        insert_entry(tx, &audit)?;
                    }
                }
                insert_history(
                    tx,
                    &service_id,
                    persisted.status,
                    persisted.latency_ms,
                    persisted.error.as_deref(),
                    persisted.checked_at,
                )?;
                Ok(())
            })
            .await
            .map_err(|e| crate::registry::wrap_internal(e, "Failed to record health check"))
    }
}

fn health_result(record: &ServiceRecord, outcome: CheckOutcome) -> ServiceHealthResult {
    let next = outcome.status.to_service_status();
    ServiceHealthResult {
        service_id: record.id.clone(),
        status: outcome.status,
        previous_status: record.status,
        status_changed: next != record.status,
        latency_ms: outcome.latency_ms,
        http_status: outcome.http_status,
        timed_out: outcome.timed_out,
        error: outcome.error,
        checked_at: outcome.checked_at,
    }
}
