//! Health sweep end to end: live downstream services, persisted status,
//! history rows and audit entries

mod common;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use common::{kernel, register, spawn_service};
use orchestra_common::{AuditEventType, AuditFilter, HealthStatus, ServiceStatus};

// ============================================================================
// Transitions
// ============================================================================

/// A 503 from /health marks the service unhealthy, writes one history row
/// and one health_changed audit entry
#[tokio::test]
async fn test_503_marks_service_unhealthy() {
    let (kernel, _dir) = kernel().await;
    let billing = spawn_service(
        Router::new().route("/health", get(|| async { StatusCode::SERVICE_UNAVAILABLE })),
    )
    .await;
    register(&kernel, "billing", &billing).await;

    let report = kernel.health.check_all_service_health(None).await.unwrap();
    assert_eq!(report.status, HealthStatus::Down);
    assert_eq!(report.summary.down, 1);
    let result = &report.services[0];
    assert_eq!(result.service_id, "billing");
    assert_eq!(result.http_status, Some(503));
    assert!(result.status_changed);
    assert_eq!(result.previous_status, ServiceStatus::Registered);

    let record = kernel.registry.get_service("billing").await.unwrap();
    assert_eq!(record.status, ServiceStatus::Unhealthy);
    assert!(record.last_health_check.is_some());

    let page = kernel
        .history
        .get_health_history(Some("billing".to_string()), None, None)
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.entries[0].status, HealthStatus::Down);

    let changes = kernel
        .audit
        .list_entries(AuditFilter {
            event_type: Some(AuditEventType::ServiceHealthChanged),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(changes.len(), 1);
    let details = changes[0].details.as_ref().unwrap();
    assert_eq!(details["previousStatus"], "registered");
    assert_eq!(details["newStatus"], "unhealthy");
    assert_eq!(changes[0].actor_id, "system");
}

/// A second identical sweep adds history but no further audit entries
#[tokio::test]
async fn test_steady_state_is_not_reaudited() {
    let (kernel, _dir) = kernel().await;
    let crm = spawn_service(Router::new().route("/health", get(|| async { "ok" }))).await;
    register(&kernel, "crm", &crm).await;

    for _ in 0..2 {
        kernel.health.check_all_service_health(None).await.unwrap();
    }

    let record = kernel.registry.get_service("crm").await.unwrap();
    assert_eq!(record.status, ServiceStatus::Healthy);

    let page = kernel
        .history
        .get_health_history(Some("crm".to_string()), None, None)
        .await
        .unwrap();
    assert_eq!(page.total, 2);

    let changes = kernel
        .audit
        .list_entries(AuditFilter {
            event_type: Some(AuditEventType::ServiceHealthChanged),
            entity_id: Some("crm".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(changes.len(), 1);

    let uptime = kernel.history.calculate_uptime("crm", None).await.unwrap();
    assert_eq!(uptime.total_checks, 2);
    assert_eq!(uptime.uptime_percent, 100.0);
}

// ============================================================================
// Rollup
// ============================================================================

/// One healthy and one down service roll up as degraded, not down
#[tokio::test]
async fn test_mixed_sweep_rolls_up_degraded() {
    let (kernel, _dir) = kernel().await;
    let up = spawn_service(Router::new().route("/health", get(|| async { "ok" }))).await;
    let down = spawn_service(
        Router::new().route("/health", get(|| async { StatusCode::INTERNAL_SERVER_ERROR })),
    )
    .await;
    register(&kernel, "crm", &up).await;
    register(&kernel, "billing", &down).await;

    let report = kernel.health.check_all_service_health(None).await.unwrap();
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.healthy, 1);
    assert_eq!(report.summary.down, 1);
    assert_eq!(report.status, HealthStatus::Degraded);
}
