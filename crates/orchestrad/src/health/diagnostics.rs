//! Liveness check and diagnostics snapshot

use crate::health::HealthChecker;
use orchestra_common::{DiagnosticsReport, KernelError, KernelResult, LivenessReport, MemoryStats};
use sysinfo::{Pid, System};
use tracing::error;

pub const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Process and host memory, in bytes
pub fn memory_stats() -> MemoryStats {
    let mut sys = System::new();
    sys.refresh_memory();

    let pid = Pid::from_u32(std::process::id());
    sys.refresh_process(pid);
    let (rss, virt) = sys
        .process(pid)
        .map(|p| (p.memory(), p.virtual_memory()))
        .unwrap_or((0, 0));

    MemoryStats {
        process_rss_bytes: rss,
        process_virtual_bytes: virt,
        system_total_bytes: sys.total_memory(),
        system_used_bytes: sys.used_memory(),
    }
}

impl HealthChecker {
    /// Cheap liveness: one trivial read, no downstream calls
    pub async fn get_health_check(&self) -> KernelResult<LivenessReport> {
        let registered = self.db().count_services().await.map_err(|e| {
            error!("[HEALTH] Liveness check could not reach the database: {}", e);
            KernelError::ServiceUnavailable("database unreachable".to_string())
        })?;

        Ok(LivenessReport {
            status: "ok".to_string(),
            database: true,
            registered_services: registered,
            uptime_seconds: self.uptime_seconds(),
            version: KERNEL_VERSION.to_string(),
        })
    }

    /// Full sweep plus memory and build information
    pub async fn get_diagnostics(&self) -> KernelResult<DiagnosticsReport> {
        let health = self.check_all_service_health(None).await?;
        let memory = tokio::task::spawn_blocking(memory_stats)
            .await
            .map_err(|e| KernelError::internal("Failed to collect memory stats", e))?;

        Ok(DiagnosticsReport {
            health,
            memory,
            version: KERNEL_VERSION.to_string(),
            environment: self.environment().to_string(),
            uptime_seconds: self.uptime_seconds(),
        })
    }
}
