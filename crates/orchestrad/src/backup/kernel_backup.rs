//! Kernel backup artifacts: encrypted snapshots of the kernel's own state
//!
//! A snapshot holds services, configs (minus the encryption key) and
//! schedules. It is encrypted with the managed key and written through
//! [`BackupStorage`].

use crate::audit::AuditLog;
use crate::backup::crypto::{decrypt_backup, encrypt_backup, KeyManager};
use crate::backup::r2::sha256_hex;
use crate::backup::schedule::{load_all_schedules, write_schedule};
use crate::backup::storage::BackupStorage;
use crate::config_store::{load_all_configs, write_config};
use crate::db::KernelDb;
use crate::metrics::KernelMetrics;
use crate::registry::{load_all_services, replace_service, wrap_internal};
use chrono::{DateTime, Utc};
use orchestra_common::*;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;
const OBJECT_PREFIX: &str = "kernel-backups";
const AUDIT_ENTITY: &str = "kernel";

const BACKUP_COLUMNS: &str =
    "id, object_key, provider, local_path, checksum, size_bytes, encrypted, created_by, created_at";

struct RawBackupRow {
    id: String,
    object_key: String,
    provider: String,
    local_path: Option<String>,
    checksum: String,
    size_bytes: i64,
    encrypted: bool,
    created_by: String,
    created_at: DateTime<Utc>,
}

impl RawBackupRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            object_key: row.get(1)?,
            provider: row.get(2)?,
            local_path: row.get(3)?,
            checksum: row.get(4)?,
            size_bytes: row.get(5)?,
            encrypted: row.get(6)?,
            created_by: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_record(self) -> KernelResult<KernelBackupRecord> {
        let provider = self
            .provider
            .parse::<StorageProvider>()
            .map_err(|e| KernelError::internal("Corrupt kernel backup row", e))?;
        Ok(KernelBackupRecord {
            id: self.id,
            object: StoredObject {
                object_key: self.object_key,
                provider,
                local_path: self.local_path,
                checksum: self.checksum,
                size_bytes: self.size_bytes.max(0) as u64,
            },
            encrypted: self.encrypted,
            created_by: self.created_by,
            created_at: self.created_at,
        })
    }
}

fn insert_backup(conn: &Connection, record: &KernelBackupRecord) -> KernelResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO kernel_backups ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            BACKUP_COLUMNS
        ),
        params![
            record.id,
            record.object.object_key,
            record.object.provider.as_str(),
            record.object.local_path,
            record.object.checksum,
            record.object.size_bytes as i64,
            record.encrypted,
            record.created_by,
            record.created_at,
        ],
    )?;
    Ok(())
}

fn load_backup(conn: &Connection, id: &str) -> KernelResult<Option<KernelBackupRecord>> {
    let sql = format!("SELECT {} FROM kernel_backups WHERE id = ?1", BACKUP_COLUMNS);
    conn.query_row(&sql, params![id], RawBackupRow::from_row)
        .optional()?
        .map(RawBackupRow::into_record)
        .transpose()
}

fn not_found(id: &str) -> KernelError {
    KernelError::not_found(format!("Kernel backup not found: {}", id))
}

/// Read the current kernel state. The encryption key never leaves the store.
fn capture_snapshot(conn: &Connection) -> KernelResult<KernelSnapshot> {
    let configs = load_all_configs(conn)?
        .into_iter()
        .filter(|c| c.key != ENCRYPTION_KEY_CONFIG_KEY)
        .collect();
    Ok(KernelSnapshot {
        format_version: SNAPSHOT_FORMAT_VERSION,
        services: load_all_services(conn)?,
        configs,
        schedules: load_all_schedules(conn)?,
        created_at: Utc::now(),
    })
}

fn apply_snapshot(conn: &Connection, snapshot: &KernelSnapshot) -> KernelResult<()> {
    for service in &snapshot.services {
        replace_service(conn, service)?;
    }
    for config in &snapshot.configs {
        if config.key == ENCRYPTION_KEY_CONFIG_KEY {
            continue;
        }
        write_config(conn, config)?;
    }
    for schedule in &snapshot.schedules {
        write_schedule(conn, schedule)?;
    }
    Ok(())
}

fn verification(
    record: &KernelBackupRecord,
    provider_used: StorageProvider,
    checksum_ok: bool,
    snapshot: Option<&KernelSnapshot>,
) -> KernelBackupVerification {
    let count = |n: usize| n as u32;
    KernelBackupVerification {
        id: record.id.clone(),
        checksum_ok,
        provider_used,
        services: snapshot.map_or(0, |s| count(s.services.len())),
        configs: snapshot.map_or(0, |s| count(s.configs.len())),
        schedules: snapshot.map_or(0, |s| count(s.schedules.len())),
    }
}

#[derive(Clone)]
pub struct KernelBackups {
    db: KernelDb,
    storage: BackupStorage,
    keys: KeyManager,
    audit: AuditLog,
    metrics: KernelMetrics,
}

impl KernelBackups {
    pub fn new(
        db: KernelDb,
        storage: BackupStorage,
        keys: KeyManager,
        audit: AuditLog,
        metrics: KernelMetrics,
    ) -> Self {
        Self {
            db,
            storage,
            keys,
            audit,
            metrics,
        }
    }

    pub async fn create_kernel_backup(&self, actor: &Actor) -> KernelResult<KernelBackupRecord> {
        let id = Uuid::new_v4().to_string();
        self.audit
            .record(AuditLogEntry::new(
                AuditEventType::BackupStarted,
                AUDIT_ENTITY,
                &id,
                actor,
            ))
            .await?;

        match self.write_backup(&id, actor).await {
            Ok((record, snapshot)) => {
                self.metrics
                    .record_kernel_backup(record.object.provider.as_str());
                self.audit
                    .record(
                        AuditLogEntry::new(AuditEventType::BackupCompleted, AUDIT_ENTITY, &id, actor)
                            .with_details(json!({
                                "provider": record.object.provider,
                                "sizeBytes": record.object.size_bytes,
                                "checksum": record.object.checksum,
                                "services": snapshot.services.len(),
                                "configs": snapshot.configs.len(),
                                "schedules": snapshot.schedules.len(),
                            })),
                    )
                    .await?;
                info!(
                    "[BACKUP] Kernel backup {} stored via {} ({} bytes)",
                    id,
                    record.object.provider.as_str(),
                    record.object.size_bytes
                );
                Ok(record)
            }
            Err(e) => {
                warn!("[BACKUP] Kernel backup {} failed: {}", id, e);
                self.audit
                    .record(
                        AuditLogEntry::new(AuditEventType::BackupFailed, AUDIT_ENTITY, &id, actor)
                            .with_details(json!({ "error": e.to_string() })),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn write_backup(
        &self,
        id: &str,
        actor: &Actor,
    ) -> KernelResult<(KernelBackupRecord, KernelSnapshot)> {
        let key = self.keys.get_or_generate_encryption_key(actor).await?;
        let snapshot = self
            .db
            .execute(capture_snapshot)
            .await
            .map_err(|e| wrap_internal(e, "Failed to capture kernel snapshot"))?;

        let plaintext = serde_json::to_vec(&snapshot)?;
        let blob = encrypt_backup(&plaintext, &key)?;
        let object = self
            .storage
            .store(&format!("{}/{}.bin", OBJECT_PREFIX, id), &blob)
            .await?;

        let record = KernelBackupRecord {
            id: id.to_string(),
            object,
            encrypted: true,
            created_by: actor.id.clone(),
            created_at: snapshot.created_at,
        };

        let row = record.clone();
        if let Err(e) = self.db.execute(move |conn| insert_backup(conn, &row)).await {
            if let Err(cleanup) = self.storage.delete(&record.object).await {
                warn!("[BACKUP] Could not remove orphaned object {}: {}", id, cleanup);
            }
            return Err(wrap_internal(e, "Failed to record kernel backup"));
        }
        Ok((record, snapshot))
    }

    /// Newest first
    pub async fn list_kernel_backups(&self) -> KernelResult<Vec<KernelBackupRecord>> {
        self.db
            .execute(|conn| {
                let sql = format!(
                    "SELECT {} FROM kernel_backups ORDER BY created_at DESC, rowid DESC",
                    BACKUP_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], RawBackupRow::from_row)?;
                let mut records = Vec::new();
                for row in rows {
                    records.push(row?.into_record()?);
                }
                Ok(records)
            })
            .await
            .map_err(|e| wrap_internal(e, "Failed to list kernel backups"))
    }

    pub async fn get_kernel_backup(&self, id: &str) -> KernelResult<KernelBackupRecord> {
        let key = id.to_string();
        self.db
            .execute(move |conn| load_backup(conn, &key))
            .await
            .map_err(|e| wrap_internal(e, "Failed to load kernel backup"))?
            .ok_or_else(|| not_found(id))
    }

    /// Fetch, checksum, decrypt and parse. A checksum mismatch is reported,
    /// not raised, and stops before decryption.
    async fn open_backup(
        &self,
        record: &KernelBackupRecord,
    ) -> KernelResult<(KernelBackupVerification, Option<KernelSnapshot>)> {
        let (bytes, provider_used) = self.storage.retrieve(&record.object).await?;
        if sha256_hex(&bytes) != record.object.checksum {
            warn!("[BACKUP] Checksum mismatch for kernel backup {}", record.id);
            return Ok((verification(record, provider_used, false, None), None));
        }

        let plaintext = if record.encrypted {
            let key = self.keys.load_encryption_key().await?;
            decrypt_backup(&bytes, &key)?
        } else {
            bytes
        };
        let snapshot: KernelSnapshot = serde_json::from_slice(&plaintext)
            .map_err(|e| KernelError::internal("Kernel snapshot is unreadable", e))?;
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(KernelError::validation(format!(
                "unsupported snapshot format version {}",
                snapshot.format_version
            )));
        }

        Ok((
            verification(record, provider_used, true, Some(&snapshot)),
            Some(snapshot),
        ))
    }

    pub async fn verify_kernel_backup(&self, id: &str) -> KernelResult<KernelBackupVerification> {
        let record = self.get_kernel_backup(id).await?;
        let (report, _) = self.open_backup(&record).await?;
        Ok(report)
    }

    /// Verify, then write every service, config and schedule back in one transaction
    pub async fn restore_kernel_backup(
        &self,
        id: &str,
        actor: &Actor,
    ) -> KernelResult<KernelBackupVerification> {
        let record = self.get_kernel_backup(id).await?;
        self.audit
            .record(AuditLogEntry::new(
                AuditEventType::RestoreStarted,
                AUDIT_ENTITY,
                id,
                actor,
            ))
            .await?;

        let outcome = async {
            let (report, snapshot) = self.open_backup(&record).await?;
            let snapshot = snapshot.ok_or_else(|| {
                KernelError::internal(
                    "Kernel backup failed verification",
                    "checksum does not match the recorded value",
                )
            })?;
            self.db
                .transaction(move |tx| apply_snapshot(tx, &snapshot))
                .await
                .map_err(|e| wrap_internal(e, "Failed to apply kernel snapshot"))?;
            Ok::<_, KernelError>(report)
        }
        .await;

        match outcome {
            Ok(report) => {
                self.audit
                    .record(
                        AuditLogEntry::new(AuditEventType::RestoreCompleted, AUDIT_ENTITY, id, actor)
                            .with_details(json!({
                                "services": report.services,
                                "configs": report.configs,
                                "schedules": report.schedules,
                                "provider": report.provider_used,
                            })),
                    )
                    .await?;
                info!(
                    "[BACKUP] Restored kernel backup {}: {} services, {} configs, {} schedules",
                    id, report.services, report.configs, report.schedules
                );
                Ok(report)
            }
            Err(e) => {
                warn!("[BACKUP] Restore of kernel backup {} failed: {}", id, e);
                self.audit
                    .record(
                        AuditLogEntry::new(AuditEventType::RestoreFailed, AUDIT_ENTITY, id, actor)
                            .with_details(json!({ "error": e.to_string() })),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    /// Remove the stored object from every location, then the row
    pub async fn delete_kernel_backup(&self, id: &str) -> KernelResult<KernelBackupRecord> {
        let record = self.get_kernel_backup(id).await?;
        self.storage.delete(&record.object).await?;

        let key = id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute("DELETE FROM kernel_backups WHERE id = ?1", params![key])?;
                Ok(())
            })
            .await
            .map_err(|e| wrap_internal(e, "Failed to delete kernel backup"))?;

        info!("[BACKUP] Deleted kernel backup {}", id);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::schedule::ScheduleStore;
    use crate::config_store::ConfigStore;
    use crate::registry::ServiceRegistry;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: KernelDb,
        backups: KernelBackups,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = KernelDb::open_in_memory().await.unwrap();
        let backups = KernelBackups::new(
            db.clone(),
            BackupStorage::new(dir.path().join("backups"), None),
            KeyManager::new(ConfigStore::new(db.clone())),
            AuditLog::new(db.clone()),
            KernelMetrics::new().unwrap(),
        );

        let actor = Actor::user("ops");
        ServiceRegistry::new(db.clone())
            .register_service(RegisterServiceInput::new("billing", "https://billing.internal"), &actor)
            .await
            .unwrap();
        ConfigStore::new(db.clone())
            .set_config(SetConfigInput::new("ui.theme", json!("dark")), &actor)
            .await
            .unwrap();
        ScheduleStore::new(db.clone())
            .create_schedule(CreateScheduleInput::new("nightly", "0 3 * * *"), &actor)
            .await
            .unwrap();

        Fixture {
            _dir: dir,
            db,
            backups,
        }
    }

    #[tokio::test]
    async fn test_create_verify_and_list() {
        let f = fixture().await;
        let record = f.backups.create_kernel_backup(&Actor::user("ops")).await.unwrap();
        assert!(record.encrypted);
        assert_eq!(record.object.provider, StorageProvider::Local);
        assert_eq!(record.created_by, "ops");

        let report = f.backups.verify_kernel_backup(&record.id).await.unwrap();
        assert!(report.checksum_ok);
        assert_eq!(report.services, 1);
        // The encryption key created by the backup itself is excluded
        assert_eq!(report.configs, 1);
        assert_eq!(report.schedules, 1);

        let listed = f.backups.list_kernel_backups().await.unwrap();
        assert_eq!(listed, vec![record]);
    }

    #[tokio::test]
    async fn test_snapshot_never_contains_encryption_key() {
        let f = fixture().await;
        let record = f.backups.create_kernel_backup(&Actor::system()).await.unwrap();

        let bytes = tokio::fs::read(record.object.local_path.as_ref().unwrap())
            .await
            .unwrap();
        let key = KeyManager::new(ConfigStore::new(f.db.clone()))
            .load_encryption_key()
            .await
            .unwrap();
        let snapshot: KernelSnapshot =
            serde_json::from_slice(&decrypt_backup(&bytes, &key).unwrap()).unwrap();
        assert!(snapshot
            .configs
            .iter()
            .all(|c| c.key != ENCRYPTION_KEY_CONFIG_KEY));
    }

    #[tokio::test]
    async fn test_restore_brings_back_removed_state() {
        let f = fixture().await;
        let actor = Actor::user("ops");
        let record = f.backups.create_kernel_backup(&actor).await.unwrap();

        let registry = ServiceRegistry::new(f.db.clone());
        registry.unregister_service("billing", &actor).await.unwrap();
        ConfigStore::new(f.db.clone())
            .delete_config("ui.theme", &actor)
            .await
            .unwrap();

        let report = f.backups.restore_kernel_backup(&record.id, &actor).await.unwrap();
        assert_eq!(report.services, 1);
        assert_eq!(registry.get_service("billing").await.unwrap().endpoint, "https://billing.internal");
        assert_eq!(
            ConfigStore::new(f.db.clone()).get_config("ui.theme").await.unwrap().value,
            json!("dark")
        );

        let completed = AuditLog::new(f.db.clone())
            .list_entries(AuditFilter {
                entity_type: Some("kernel".to_string()),
                event_type: Some(AuditEventType::RestoreCompleted),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn test_tampered_object_fails_verification_and_restore() {
        let f = fixture().await;
        let actor = Actor::system();
        let record = f.backups.create_kernel_backup(&actor).await.unwrap();

        let path = record.object.local_path.clone().unwrap();
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        tokio::fs::write(&path, &bytes).await.unwrap();

        let report = f.backups.verify_kernel_backup(&record.id).await.unwrap();
        assert!(!report.checksum_ok);

        let err = f.backups.restore_kernel_backup(&record.id, &actor).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        let failed = AuditLog::new(f.db.clone())
            .list_entries(AuditFilter {
                event_type: Some(AuditEventType::RestoreFailed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].entity_id, record.id);
    }

    #[tokio::test]
    async fn test_delete_removes_object_and_row() {
        let f = fixture().await;
        let record = f.backups.create_kernel_backup(&Actor::system()).await.unwrap();
        let path = record.object.local_path.clone().unwrap();

        f.backups.delete_kernel_backup(&record.id).await.unwrap();
        assert!(!std::path::Path::new(&path).exists());
        let err = f.backups.get_kernel_backup(&record.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(f.backups.list_kernel_backups().await.unwrap().is_empty());
    }
}
