//! Kernel assembly: one place that builds every component from config

use crate::audit::AuditLog;
use crate::backup::{
    BackupCoordinator, BackupStorage, KernelBackups, KeyManager, ObjectStore, R2Config, R2Store,
    ScheduleStore,
};
use crate::config::KernelConfig;
use crate::config_store::ConfigStore;
use crate::db::KernelDb;
use crate::downstream::DownstreamClient;
use crate::health::{HealthChecker, HealthHistory};
use crate::metrics::KernelMetrics;
use crate::nav::{CircuitBreaker, NavAggregator};
use crate::registry::ServiceRegistry;
use orchestra_common::{KernelError, KernelResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

pub struct Kernel {
    pub db: KernelDb,
    pub registry: ServiceRegistry,
    pub audit: AuditLog,
    pub config: ConfigStore,
    pub health: HealthChecker,
    pub history: HealthHistory,
    pub nav: NavAggregator,
    pub coordinator: BackupCoordinator,
    pub schedules: ScheduleStore,
    pub kernel_backups: KernelBackups,
    pub metrics: KernelMetrics,
}

impl Kernel {
    /// Open the database from config and detect the primary object store from env
    pub async fn open(config: &KernelConfig, started_at: Instant) -> KernelResult<Self> {
        let db = KernelDb::open(&config.storage.db_path).await?;
        let client = DownstreamClient::new()?;

        let primary = R2Config::from_env().map(|r2| {
            info!(
                "[BOOT] Primary backup store: r2 bucket '{}' at {}",
                r2.bucket,
                r2.endpoint_url()
            );
            Arc::new(R2Store::new(
                client.inner().clone(),
                r2,
                Duration::from_secs(config.backup.object_store_timeout_secs),
            )) as Arc<dyn ObjectStore>
        });
        if primary.is_none() {
            info!("[BOOT] No primary backup store configured, backups stay local");
        }

        Self::assemble(db, config, client, primary, started_at)
    }

    pub fn assemble(
        db: KernelDb,
        config: &KernelConfig,
        client: DownstreamClient,
        primary: Option<Arc<dyn ObjectStore>>,
        started_at: Instant,
    ) -> KernelResult<Self> {
        let metrics = KernelMetrics::new()
            .map_err(|e| KernelError::internal("Failed to register metrics", e))?;
        let registry = ServiceRegistry::new(db.clone());
        let audit = AuditLog::new(db.clone());
        let config_store = ConfigStore::new(db.clone());

        let health = HealthChecker::new(db.clone(), client.clone(), metrics.clone(), started_at)
            .with_max_concurrency(config.health.max_concurrent_checks)
            .with_timeout_override(config.health_timeout_override())
            .with_environment(config.environment.clone());

        let breaker = Arc::new(CircuitBreaker::new(
            config.nav.breaker_threshold,
            config.breaker_reset(),
        ));
        let nav = NavAggregator::new(registry.clone(), client.clone(), breaker, metrics.clone())
            .with_manifest_timeout(config.manifest_timeout())
            .with_max_concurrency(config.nav.max_concurrent_fetches);

        let coordinator =
            BackupCoordinator::new(registry.clone(), audit.clone(), client, metrics.clone())
                .with_timeouts(config.trigger_timeout(), config.restore_timeout())
                .with_max_concurrency(config.backup.max_concurrent_triggers);

        let kernel_backups = KernelBackups::new(
            db.clone(),
            BackupStorage::new(&config.storage.backup_dir, primary),
            KeyManager::new(config_store.clone()),
            audit.clone(),
            metrics.clone(),
        );

        Ok(Self {
            history: HealthHistory::new(db.clone()),
            schedules: ScheduleStore::new(db.clone()),
            db,
            registry,
            audit,
            config: config_store,
            health,
            nav,
            coordinator,
            kernel_backups,
            metrics,
        })
    }
}
