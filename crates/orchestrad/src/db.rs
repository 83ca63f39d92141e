//! Kernel database - single SQLite connection behind an async mutex
//!
//! Every query runs on the blocking pool. Multi-step writes go through
//! [`KernelDb::transaction`] so a record and its audit row commit together.

use orchestra_common::{KernelError, KernelResult};
use rusqlite::{Connection, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS services (
    id TEXT PRIMARY KEY,
    endpoint TEXT NOT NULL,
    health_check TEXT NOT NULL,
    description TEXT,
    version TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL,
    last_health_check TEXT,
    last_health_latency_ms INTEGER,
    last_health_error TEXT,
    owner_contact TEXT,
    documentation_url TEXT,
    health_check_interval_ms INTEGER NOT NULL,
    health_check_timeout_ms INTEGER NOT NULL,
    registered_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS health_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_id TEXT NOT NULL,
    status TEXT NOT NULL,
    latency_ms INTEGER,
    error_message TEXT,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_health_history_service_time
    ON health_history(service_id, recorded_at);
CREATE INDEX IF NOT EXISTS idx_health_history_time
    ON health_history(recorded_at);

CREATE TABLE IF NOT EXISTS config_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    updated_by TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    config_key TEXT NOT NULL,
    old_value TEXT NOT NULL,
    new_value TEXT NOT NULL,
    changed_by TEXT NOT NULL,
    changed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_config_history_key ON config_history(config_key, id);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    actor_type TEXT NOT NULL,
    details TEXT,
    previous_values TEXT,
    trace_id TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at);

CREATE TABLE IF NOT EXISTS backup_schedules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    cron_expression TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    backup_type TEXT NOT NULL,
    retention_days INTEGER NOT NULL,
    last_run TEXT,
    next_run TEXT,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS kernel_backups (
    id TEXT PRIMARY KEY,
    object_key TEXT NOT NULL,
    provider TEXT NOT NULL,
    local_path TEXT,
    checksum TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    encrypted INTEGER NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Shared handle to the kernel database. Cloning is cheap.
#[derive(Clone)]
pub struct KernelDb {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl KernelDb {
    /// Open (or create) the database file and apply the schema
    pub async fn open(path: impl AsRef<Path>) -> KernelResult<Self> {
        let db_path = path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    KernelError::internal("Failed to create database directory", e)
                })?;
            }
        }

        info!("[BOOT] Opening kernel database at {}", db_path.display());

        let open_path = db_path.clone();
        let conn = tokio::task::spawn_blocking(move || -> KernelResult<Connection> {
            let conn = Connection::open(&open_path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(conn)
        })
        .await
        .map_err(|e| KernelError::internal("Database open task failed", e))??;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(db_path),
        };
        db.initialize_schema().await?;
        Ok(db)
    }

    /// In-memory database, used by tests and dry runs
    pub async fn open_in_memory() -> KernelResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        };
        db.initialize_schema().await?;
        Ok(db)
    }

    async fn initialize_schema(&self) -> KernelResult<()> {
        self.execute(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        debug!("Kernel database schema initialized");
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool
    pub async fn execute<F, R>(&self, f: F) -> KernelResult<R>
    where
        F: FnOnce(&Connection) -> KernelResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| KernelError::internal("Database task failed", e))?
    }

    /// Run `f` inside a transaction. Commits on `Ok`, rolls back on `Err`.
    pub async fn transaction<F, R>(&self, f: F) -> KernelResult<R>
    where
        F: FnOnce(&Transaction<'_>) -> KernelResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
        .map_err(|e| KernelError::internal("Database task failed", e))?
    }

    /// Trivial read used by the liveness check
    pub async fn count_services(&self) -> KernelResult<u64> {
        self.execute(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM services", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}

/// Map a UNIQUE/PRIMARY KEY violation onto a conflict, anything else onto internal.
pub fn conflict_or_internal(err: rusqlite::Error, conflict: impl Into<String>) -> KernelError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            KernelError::conflict(conflict)
        }
        _ => KernelError::from(err),
    }
}

/// Decode a JSON text column, reporting the column on failure
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    raw: &str,
    column: &str,
) -> KernelResult<T> {
    serde_json::from_str(raw)
        .map_err(|e| KernelError::internal(format!("Corrupt JSON in column '{}'", column), e))
}
