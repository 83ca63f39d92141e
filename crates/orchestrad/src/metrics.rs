//! Prometheus metrics for the kernel

use orchestra_common::{KernelError, KernelResult};
use prometheus::{
    register_counter_vec_with_registry, register_histogram_vec_with_registry,
    register_int_gauge_with_registry, CounterVec, Encoder, HistogramVec, IntGauge, Registry,
    TextEncoder,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct KernelMetrics {
    pub health_checks_total: CounterVec,
    pub health_check_duration_seconds: HistogramVec,
    pub services_registered: IntGauge,
    pub system_status: IntGauge, // 0=healthy, 1=degraded, 2=down

    pub manifest_fetch_total: CounterVec,
    pub circuit_breaker_skips_total: CounterVec,

    pub fanout_operations_total: CounterVec,
    pub kernel_backups_total: CounterVec,

    registry: Arc<Registry>,
}

impl KernelMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let health_checks_total = register_counter_vec_with_registry!(
            "orchestra_health_checks_total",
            "Health checks performed by service and classified status",
            &["service", "status"],
            registry
        )?;

        let health_check_duration_seconds = register_histogram_vec_with_registry!(
            "orchestra_health_check_duration_seconds",
            "Health check round-trip time in seconds",
            &["service"],
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            registry
        )?;

        let services_registered = register_int_gauge_with_registry!(
            "orchestra_services_registered",
            "Services seen by the most recent health sweep",
            registry
        )?;

        let system_status = register_int_gauge_with_registry!(
            "orchestra_system_status",
            "Rolled-up system status: 0=healthy, 1=degraded, 2=down",
            registry
        )?;

        let manifest_fetch_total = register_counter_vec_with_registry!(
            "orchestra_manifest_fetch_total",
            "Nav manifest fetches by service and outcome",
            &["service", "status"],
            registry
        )?;

        let circuit_breaker_skips_total = register_counter_vec_with_registry!(
            "orchestra_circuit_breaker_skips_total",
            "Manifest fetches skipped because the service breaker was open",
            &["service"],
            registry
        )?;

        let fanout_operations_total = register_counter_vec_with_registry!(
            "orchestra_fanout_operations_total",
            "Per-service backup/restore trigger results",
            &["kind", "status"],
            registry
        )?;

        let kernel_backups_total = register_counter_vec_with_registry!(
            "orchestra_kernel_backups_total",
            "Kernel backups written by storage provider",
            &["provider"],
            registry
        )?;

        Ok(Self {
            health_checks_total,
            health_check_duration_seconds,
            services_registered,
            system_status,
            manifest_fetch_total,
            circuit_breaker_skips_total,
            fanout_operations_total,
            kernel_backups_total,
            registry: Arc::new(registry),
        })
    }

    pub fn record_health_check(&self, service: &str, status: &str, duration_secs: f64) {
        self.health_checks_total
            .with_label_values(&[service, status])
            .inc();
        self.health_check_duration_seconds
            .with_label_values(&[service])
            .observe(duration_secs);
    }

    pub fn update_sweep(&self, services: usize, system_status: orchestra_common::HealthStatus) {
        self.services_registered.set(services as i64);
        let value = match system_status {
            orchestra_common::HealthStatus::Healthy => 0,
            orchestra_common::HealthStatus::Degraded => 1,
            orchestra_common::HealthStatus::Down => 2,
        };
        self.system_status.set(value);
    }

    pub fn record_manifest_fetch(&self, service: &str, status: &str) {
        self.manifest_fetch_total
            .with_label_values(&[service, status])
            .inc();
    }

    pub fn record_breaker_skip(&self, service: &str) {
        self.circuit_breaker_skips_total
            .with_label_values(&[service])
            .inc();
    }

    pub fn record_fanout(&self, kind: &str, status: &str) {
        self.fanout_operations_total
            .with_label_values(&[kind, status])
            .inc();
    }

    pub fn record_kernel_backup(&self, provider: &str) {
        self.kernel_backups_total
            .with_label_values(&[provider])
            .inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> KernelResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| KernelError::internal("Failed to encode metrics", e))?;
        String::from_utf8(buffer).map_err(|e| KernelError::internal("Metrics were not UTF-8", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_common::HealthStatus;

    #[test]
    fn test_export_contains_recorded_series() {
        let metrics = KernelMetrics::new().unwrap();
        metrics.record_health_check("billing", "down", 0.02);
        metrics.record_breaker_skip("crm");
        metrics.update_sweep(2, HealthStatus::Degraded);

        let text = metrics.export().unwrap();
        assert!(text.contains("orchestra_health_checks_total{service=\"billing\",status=\"down\"} 1"));
        assert!(text.contains("orchestra_circuit_breaker_skips_total{service=\"crm\"} 1"));
        assert!(text.contains("orchestra_system_status 1"));
    }

    #[test]
    fn test_registries_are_independent() {
        // Two instances must not collide on metric names
        let a = KernelMetrics::new().unwrap();
        let b = KernelMetrics::new().unwrap();
        a.record_fanout("backup", "success");
        assert!(!b.export().unwrap().contains("orchestra_fanout_operations_total{"));
    }
}
