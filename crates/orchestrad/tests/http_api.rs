//! HTTP surface: envelopes, status codes and headers, driven through the
//! router without binding a socket

mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::routing::post;
use axum::Router;
use common::{kernel, register, spawn_service};
use orchestra_common::{AuditEventType, AuditFilter, BACKUP_TRIGGER_PATH};
use orchestrad::config::ServerConfig;
use orchestrad::{server, AppState};
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

async fn app() -> (Router, TempDir) {
    let (kernel, dir) = kernel().await;
    (server::router(AppState::new(kernel), &ServerConfig::default()), dir)
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

// ============================================================================
// Services
// ============================================================================

#[tokio::test]
async fn test_register_then_duplicate() {
    let (app, _dir) = app().await;
    let body = json!({ "id": "billing", "endpoint": "http://127.0.0.1:9" });

    let (status, reply) = send(&app, Method::POST, "/v1/services", Some(body.clone()), &[]).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["data"]["id"], "billing");
    assert_eq!(reply["data"]["status"], "registered");
    assert_eq!(reply["message"], "Service registered");

    let (status, reply) = send(&app, Method::POST, "/v1/services", Some(body), &[]).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["code"], "KERNEL_CONFLICT");

    let (status, reply) = send(&app, Method::GET, "/v1/services", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failures_carry_codes_and_trace() {
    let (app, _dir) = app().await;

    let (status, reply) = send(
        &app,
        Method::GET,
        "/v1/services/ghost",
        None,
        &[("x-trace-id", "trace-9")],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(reply["error"]["code"], "KERNEL_NOT_FOUND");
    assert_eq!(reply["error"]["requestId"], "trace-9");
    assert_eq!(reply["traceId"], "trace-9");

    let (status, reply) = send(
        &app,
        Method::POST,
        "/v1/services",
        Some(json!({ "id": "Not Valid!", "endpoint": "http://127.0.0.1:9" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(reply["error"]["code"], "KERNEL_VALIDATION");

    // Malformed JSON is a validation failure in the envelope, not a bare 4xx
    let (status, reply) = send(
        &app,
        Method::POST,
        "/v1/services",
        Some(json!({ "endpoint": 7 })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["code"], "KERNEL_VALIDATION");
}

// ============================================================================
// Config and audit
// ============================================================================

#[tokio::test]
async fn test_config_set_get_and_audit_actor() {
    let (app, _dir) = app().await;
    let alice = [("x-actor-id", "alice")];

    let (status, reply) = send(
        &app,
        Method::PUT,
        "/v1/config/ui.theme",
        Some(json!({ "value": "dark" })),
        &alice,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(reply["message"], "Config 'ui.theme' created");

    let (status, reply) = send(
        &app,
        Method::PUT,
        "/v1/config/ui.theme",
        Some(json!({ "value": "light" })),
        &alice,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["message"], "Config 'ui.theme' updated");

    let (_, reply) = send(&app, Method::GET, "/v1/config/ui.theme", None, &[]).await;
    assert_eq!(reply["data"]["value"], "light");
    assert_eq!(reply["data"]["updatedBy"], "alice");

    let (_, reply) = send(&app, Method::GET, "/v1/audit?entityType=config", None, &[]).await;
    let entries = reply["data"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e["actorId"] == "alice"));
}

#[tokio::test]
async fn test_sensitive_config_is_redacted() {
    let (app, _dir) = app().await;

    let (status, reply) = send(
        &app,
        Method::PUT,
        "/v1/config/smtp.password",
        Some(json!({ "value": "hunter2" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(reply["data"]["value"], "[REDACTED]");

    let (_, reply) = send(&app, Method::GET, "/v1/config/smtp.password", None, &[]).await;
    assert_eq!(reply["data"]["value"], "[REDACTED]");

    let (_, reply) = send(&app, Method::GET, "/v1/audit?entityType=config", None, &[]).await;
    assert!(!reply.to_string().contains("hunter2"));
}

// ============================================================================
// Health and metrics
// ============================================================================

#[tokio::test]
async fn test_liveness_and_metrics() {
    let (app, _dir) = app().await;

    let (status, reply) = send(&app, Method::GET, "/v1/health", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["data"]["database"], true);
    assert_eq!(reply["data"]["registeredServices"], 0);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("orchestra_system_status"));
}

// ============================================================================
// Request timeout
// ============================================================================

/// A request that times out answers with an envelope, and the fan-out it
/// started still finishes and writes its closing audit entry
#[tokio::test]
async fn test_timed_out_backup_still_completes() {
    let (kernel, _dir) = kernel().await;
    let slow = spawn_service(Router::new().route(
        BACKUP_TRIGGER_PATH,
        post(|| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            StatusCode::OK
        }),
    ))
    .await;
    register(&kernel, "ledger", &slow).await;

    let audit = kernel.audit.clone();
    let config = ServerConfig {
        request_timeout_secs: 1,
        ..ServerConfig::default()
    };
    let app = server::router(AppState::new(kernel), &config);

    let (status, reply) = send(&app, Method::POST, "/v1/backup/trigger", None, &[]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"]["code"], "KERNEL_SERVICE_UNAVAILABLE");

    let completed = AuditFilter {
        event_type: Some(AuditEventType::BackupCompleted),
        ..Default::default()
    };
    let mut finished = Vec::new();
    for _ in 0..40 {
        finished = audit.list_entries(completed.clone()).await.unwrap();
        if !finished.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(finished.len(), 1);
    let details = finished[0].details.as_ref().unwrap();
    assert_eq!(details["summary"]["success"], 1);
}
