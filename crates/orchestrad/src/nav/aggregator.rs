//! Nav tree aggregation across registered services

use crate::downstream::DownstreamClient;
use crate::metrics::KernelMetrics;
use crate::nav::breaker::CircuitBreaker;
use crate::registry::ServiceRegistry;
use chrono::Utc;
use orchestra_common::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub const BREAKER_OPEN_ERROR: &str = "Circuit breaker open";
pub const INVALID_MANIFEST_ERROR: &str = "Invalid manifest schema";

/// Nav-facing status of a service given its stored status and whether its
/// manifest could be loaded
pub fn nav_status(stored: ServiceStatus, manifest_loaded: bool) -> HealthStatus {
    if !manifest_loaded {
        return HealthStatus::Down;
    }
    match stored {
        ServiceStatus::Unhealthy | ServiceStatus::Unregistered => HealthStatus::Down,
        ServiceStatus::Degraded => HealthStatus::Degraded,
        ServiceStatus::Registered | ServiceStatus::Healthy => HealthStatus::Healthy,
    }
}

async fn fetch_manifest(
    client: &DownstreamClient,
    breaker: &CircuitBreaker,
    metrics: &KernelMetrics,
    record: &ServiceRecord,
    timeout: Duration,
) -> Result<NavManifest, String> {
    if !breaker.should_attempt(&record.id) {
        debug!("[NAV] Skipping manifest fetch for {}: breaker open", record.id);
        metrics.record_breaker_skip(&record.id);
        return Err(BREAKER_OPEN_ERROR.to_string());
    }

    let url = record.url_for(MANIFEST_PATH);
    let response = match client.get(&url, timeout).await {
        Ok(response) => response,
        Err(err) => {
            breaker.record_failure(&record.id);
            metrics.record_manifest_fetch(&record.id, err.status().as_str());
            warn!("[NAV] Manifest fetch for {} failed: {}", record.id, err);
            return Err(err.to_string());
        }
    };

    let code = response.status().as_u16();
    if !response.status().is_success() {
        breaker.record_failure(&record.id);
        metrics.record_manifest_fetch(
            &record.id,
            crate::downstream::RequestStatus::from_http(code).as_str(),
        );
        warn!("[NAV] Manifest fetch for {} returned HTTP {}", record.id, code);
        return Err(format!("HTTP {}", code));
    }

    let parsed = match response.json::<serde_json::Value>().await {
        Ok(body) => NavManifest::from_value(body)
            .and_then(|manifest| manifest.check_owner(&record.id).map(|_| manifest))
            .map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    match parsed {
        Ok(manifest) => {
            breaker.record_success(&record.id);
            metrics.record_manifest_fetch(&record.id, "success");
            Ok(manifest)
        }
        Err(detail) => {
            breaker.record_failure(&record.id);
            metrics.record_manifest_fetch(&record.id, "invalid_body");
            warn!("[NAV] Invalid manifest from {}: {}", record.id, detail);
            Err(INVALID_MANIFEST_ERROR.to_string())
        }
    }
}

pub struct NavAggregator {
    registry: ServiceRegistry,
    client: DownstreamClient,
    breaker: Arc<CircuitBreaker>,
    metrics: KernelMetrics,
    manifest_timeout: Duration,
    max_concurrency: usize,
}

impl NavAggregator {
    pub fn new(
        registry: ServiceRegistry,
        client: DownstreamClient,
        breaker: Arc<CircuitBreaker>,
        metrics: KernelMetrics,
    ) -> Self {
        Self {
            registry,
            client,
            breaker,
            metrics,
            manifest_timeout: Duration::from_millis(5000),
            max_concurrency: 16,
        }
    }

    pub fn with_manifest_timeout(mut self, timeout: Duration) -> Self {
        self.manifest_timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Fetch every manifest concurrently and merge them, filtered by the
    /// caller's capabilities
    pub async fn get_nav_tree(
        &self,
        user: Option<NavUser>,
        tenant: Option<String>,
    ) -> KernelResult<NavTree> {
        let records: Vec<ServiceRecord> = self
            .registry
            .list_records()
            .await?
            .into_iter()
            .filter(|r| r.status != ServiceStatus::Unregistered)
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set = JoinSet::new();
        for record in records.iter().cloned() {
            let client = self.client.clone();
            let breaker = Arc::clone(&self.breaker);
            let metrics = self.metrics.clone();
            let semaphore = Arc::clone(&semaphore);
            let timeout = self.manifest_timeout;
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let fetched = fetch_manifest(&client, &breaker, &metrics, &record, timeout).await;
                (record.id, fetched)
            });
        }

        let mut fetched: HashMap<String, Result<NavManifest, String>> = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((id, result)) => {
                    fetched.insert(id, result);
                }
                Err(e) => warn!("[NAV] Manifest task failed: {}", e),
            }
        }

        let capabilities: &[String] = user
            .as_ref()
            .map(|u| u.capabilities.as_slice())
            .unwrap_or(&[]);

        let services = records
            .iter()
            .map(|record| {
                let result = fetched
                    .remove(&record.id)
                    .unwrap_or_else(|| Err("Manifest task failed".to_string()));
                match result {
                    Ok(manifest) => NavServiceEntry {
                        id: record.id.clone(),
                        label: manifest
                            .label
                            .clone()
                            .or_else(|| record.description.clone())
                            .unwrap_or_else(|| record.id.clone()),
                        status: nav_status(record.status, true),
                        error: None,
                        groups: filter_groups(manifest.groups, capabilities),
                    },
                    Err(error) => NavServiceEntry {
                        id: record.id.clone(),
                        label: record.description.clone().unwrap_or_else(|| record.id.clone()),
                        status: nav_status(record.status, false),
                        error: Some(error),
                        groups: Vec::new(),
                    },
                }
            })
            .collect();

        Ok(NavTree {
            services,
            user,
            tenant,
            timestamp: Utc::now(),
        })
    }

    /// Status-only rollup from stored registry state plus breaker state;
    /// no network calls
    pub async fn get_shell_health(&self) -> KernelResult<ShellHealth> {
        let records = self.registry.list_records().await?;
        let services: Vec<ShellServiceStatus> = records
            .iter()
            .map(|r| ShellServiceStatus {
                id: r.id.clone(),
                status: HealthStatus::from_stored(r.status),
                breaker_open: self.breaker.is_open(&r.id),
            })
            .collect();
        let summary = HealthSummary::from_statuses(services.iter().map(|s| s.status));

        Ok(ShellHealth {
            status: summary.system_status(),
            summary,
            services,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::KernelDb;

    #[test]
    fn test_nav_status_mapping() {
        assert_eq!(nav_status(ServiceStatus::Unhealthy, true), HealthStatus::Down);
        assert_eq!(nav_status(ServiceStatus::Healthy, false), HealthStatus::Down);
        assert_eq!(nav_status(ServiceStatus::Degraded, true), HealthStatus::Degraded);
        assert_eq!(nav_status(ServiceStatus::Registered, true), HealthStatus::Healthy);
        assert_eq!(nav_status(ServiceStatus::Healthy, true), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_shell_health_treats_registered_as_degraded() {
        let db = KernelDb::open_in_memory().await.unwrap();
        let registry = ServiceRegistry::new(db);
        let actor = Actor::system();
        registry
            .register_service(RegisterServiceInput::new("billing", "http://billing.internal"), &actor)
            .await
            .unwrap();
        registry
            .register_service(RegisterServiceInput::new("crm", "http://crm.internal"), &actor)
            .await
            .unwrap();
        registry
            .update_service_status("crm", ServiceStatus::Healthy, HealthObservation::default())
            .await
            .unwrap();

        let aggregator = NavAggregator::new(
            registry,
            DownstreamClient::new().unwrap(),
            Arc::new(CircuitBreaker::default()),
            KernelMetrics::new().unwrap(),
        );
        let shell = aggregator.get_shell_health().await.unwrap();
        assert_eq!(shell.summary.degraded, 1);
        assert_eq!(shell.summary.healthy, 1);
        assert_eq!(shell.summary.total, 2);
        assert_eq!(shell.status, HealthStatus::Degraded);
        assert!(shell.services.iter().all(|s| !s.breaker_open));
    }

    #[tokio::test]
    async fn test_open_breaker_skips_network() {
        let db = KernelDb::open_in_memory().await.unwrap();
        let registry = ServiceRegistry::new(db);
        // Nothing listens here; an attempted fetch would report a connection error
        registry
            .register_service(RegisterServiceInput::new("billing", "http://127.0.0.1:9"), &Actor::system())
            .await
            .unwrap();

        let breaker = Arc::new(CircuitBreaker::default());
        for _ in 0..3 {
            breaker.record_failure("billing");
        }

        let aggregator = NavAggregator::new(
            registry,
            DownstreamClient::new().unwrap(),
            Arc::clone(&breaker),
            KernelMetrics::new().unwrap(),
        );
        let tree = aggregator.get_nav_tree(None, None).await.unwrap();
        assert_eq!(tree.services.len(), 1);
        assert_eq!(tree.services[0].error.as_deref(), Some(BREAKER_OPEN_ERROR));
        assert_eq!(tree.services[0].status, HealthStatus::Down);
        assert_eq!(breaker.failure_count("billing"), 3);

        let shell = aggregator.get_shell_health().await.unwrap();
        assert!(shell.services[0].breaker_open);
    }
}
