//! Shared fixtures: an on-disk kernel and throwaway downstream services
#![allow(dead_code)]

use axum::Router;
use orchestra_common::{Actor, RegisterServiceInput, ServiceStatus};
use orchestrad::config::KernelConfig;
use orchestrad::db::KernelDb;
use orchestrad::downstream::DownstreamClient;
use orchestrad::Kernel;
use std::time::Instant;
use tempfile::TempDir;

/// Kernel backed by a temp directory; keep the `TempDir` alive for the test
pub async fn kernel() -> (Kernel, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = KernelConfig::default();
    config.storage.db_path = dir.path().join("kernel.db");
    config.storage.backup_dir = dir.path().join("backups");

    let db = KernelDb::open(&config.storage.db_path).await.unwrap();
    let kernel = Kernel::assemble(
        db,
        &config,
        DownstreamClient::new().unwrap(),
        None,
        Instant::now(),
    )
    .unwrap();
    (kernel, dir)
}

/// Serve `router` on an ephemeral port and return its base URL
pub async fn spawn_service(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Base URL nothing listens on
pub fn dead_endpoint() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub async fn register(kernel: &Kernel, id: &str, endpoint: &str) {
    kernel
        .registry
        .register_service(RegisterServiceInput::new(id, endpoint), &Actor::system())
        .await
        .unwrap();
}

pub async fn set_status(kernel: &Kernel, id: &str, status: ServiceStatus) {
    kernel
        .registry
        .update_service_status(id, status, Default::default())
        .await
        .unwrap();
}
