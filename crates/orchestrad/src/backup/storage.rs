//! Dual-write backup storage: optional primary object store plus a local copy
//!
//! The local copy is always attempted. Errors from both locations are
//! combined rather than short-circuited.

use crate::backup::r2::sha256_hex;
use async_trait::async_trait;
use orchestra_common::{KernelError, KernelResult, StorageProvider, StoredObject};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn provider(&self) -> StorageProvider;
    async fn put_object(&self, key: &str, bytes: &[u8]) -> KernelResult<()>;
    async fn get_object(&self, key: &str) -> KernelResult<Vec<u8>>;
    async fn delete_object(&self, key: &str) -> KernelResult<()>;
}

fn validate_object_key(key: &str) -> KernelResult<()> {
    let path = Path::new(key);
    let safe = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(KernelError::validation(format!("invalid object key '{}'", key)))
    }
}

#[derive(Clone)]
pub struct BackupStorage {
    primary: Option<Arc<dyn ObjectStore>>,
    local_dir: PathBuf,
}

impl BackupStorage {
    pub fn new(local_dir: impl Into<PathBuf>, primary: Option<Arc<dyn ObjectStore>>) -> Self {
        Self {
            primary,
            local_dir: local_dir.into(),
        }
    }

    /// Write to primary (if configured) and locally. Succeeds if either did.
    pub async fn store(&self, object_key: &str, bytes: &[u8]) -> KernelResult<StoredObject> {
        validate_object_key(object_key)?;
        let checksum = sha256_hex(bytes);
        let mut errors = Vec::new();

        let mut provider = StorageProvider::Local;
        if let Some(primary) = &self.primary {
            match primary.put_object(object_key, bytes).await {
                Ok(()) => provider = primary.provider(),
                Err(e) => {
                    warn!(
                        "[BACKUP] Primary upload of {} failed, falling back to local: {}",
                        object_key, e
                    );
                    errors.push(format!("{}: {}", primary.provider().as_str(), describe(&e)));
                }
            }
        }

        let local_path = self.local_dir.join(object_key);
        let local_result = async {
            if let Some(parent) = local_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&local_path, bytes).await
        }
        .await;

        let local_path = match local_result {
            Ok(()) => Some(local_path.to_string_lossy().into_owned()),
            Err(e) => {
                warn!("[BACKUP] Local copy of {} failed: {}", object_key, e);
                errors.push(format!("local: {}", e));
                None
            }
        };

        if provider == StorageProvider::Local && local_path.is_none() {
            return Err(KernelError::internal(
                "Failed to store backup object",
                errors.join("; "),
            ));
        }

        info!(
            "[BACKUP] Stored {} ({} bytes) via {}",
            object_key,
            bytes.len(),
            provider.as_str()
        );
        Ok(StoredObject {
            object_key: object_key.to_string(),
            provider,
            local_path,
            checksum,
            size_bytes: bytes.len() as u64,
        })
    }

    /// Primary first when that is where the object went, then the local copy.
    /// Returns the bytes and the provider that served them.
    pub async fn retrieve(&self, object: &StoredObject) -> KernelResult<(Vec<u8>, StorageProvider)> {
        let mut errors = Vec::new();

        if object.provider != StorageProvider::Local {
            match &self.primary {
                Some(primary) => match primary.get_object(&object.object_key).await {
                    Ok(bytes) => return Ok((bytes, primary.provider())),
                    Err(e) => {
                        warn!(
                            "[BACKUP] Primary download of {} failed: {}",
                            object.object_key, e
                        );
                        errors.push(format!("{}: {}", object.provider.as_str(), describe(&e)));
                    }
                },
                None => errors.push(format!("{}: store not configured", object.provider.as_str())),
            }
        }

        match &object.local_path {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => return Ok((bytes, StorageProvider::Local)),
                Err(e) => errors.push(format!("local: {}", e)),
            },
            None => errors.push("local: no local copy recorded".to_string()),
        }

        Err(KernelError::internal(
            "Failed to retrieve backup object",
            errors.join("; "),
        ))
    }

    /// Remove from every location the object was written to
    pub async fn delete(&self, object: &StoredObject) -> KernelResult<()> {
        let mut errors = Vec::new();

        if object.provider != StorageProvider::Local {
            match &self.primary {
                Some(primary) => {
                    if let Err(e) = primary.delete_object(&object.object_key).await {
                        errors.push(format!("{}: {}", object.provider.as_str(), describe(&e)));
                    }
                }
                None => errors.push(format!("{}: store not configured", object.provider.as_str())),
            }
        }

        if let Some(path) = &object.local_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => errors.push(format!("local: {}", e)),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(KernelError::internal(
                "Failed to delete backup object",
                errors.join("; "),
            ))
        }
    }
}

fn describe(err: &KernelError) -> String {
    match err.details() {
        Some(details) => format!("{} ({})", err, details),
        None => err.to_string(),
    }
}
