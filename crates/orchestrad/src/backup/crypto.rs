//! Backup encryption: AES-256-GCM with a 16-byte IV
//!
//! Wire format: `[IV(16)][Tag(16)][Ciphertext]`. The key lives base64-encoded
//! in the config store under `system.backup.encryption_key`.

use crate::config_store::ConfigStore;
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use orchestra_common::*;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{json, Value};
use tracing::info;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
pub const HEADER_LEN: usize = IV_LEN + TAG_LEN;
pub const ALGORITHM: &str = "aes-256-gcm";

type BackupCipher = AesGcm<Aes256, U16>;

pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

fn cipher_for(key: &[u8]) -> KernelResult<BackupCipher> {
    if key.len() != KEY_LEN {
        return Err(KernelError::validation(format!(
            "encryption key must be {} bytes, got {}",
            KEY_LEN,
            key.len()
        )));
    }
    BackupCipher::new_from_slice(key).map_err(|e| KernelError::internal("Invalid encryption key", e))
}

pub fn encrypt_backup(data: &[u8], key: &[u8]) -> KernelResult<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut buffer = data.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
        .map_err(|e| KernelError::internal("Backup encryption failed", e))?;

    let mut out = Vec::with_capacity(HEADER_LEN + buffer.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(tag.as_slice());
    out.extend_from_slice(&buffer);
    Ok(out)
}

/// Fails VALIDATION on a truncated blob, INTERNAL when authentication fails
pub fn decrypt_backup(blob: &[u8], key: &[u8]) -> KernelResult<Vec<u8>> {
    if blob.len() < HEADER_LEN {
        return Err(KernelError::validation(format!(
            "encrypted backup must be at least {} bytes, got {}",
            HEADER_LEN,
            blob.len()
        )));
    }
    let cipher = cipher_for(key)?;
    let (iv, rest) = blob.split_at(IV_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(iv),
            b"",
            &mut buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| {
            KernelError::internal(
                "Backup decryption failed",
                "authentication tag mismatch (wrong key or tampered data)",
            )
        })?;
    Ok(buffer)
}

fn decode_key(value: &Value) -> KernelResult<[u8; KEY_LEN]> {
    let encoded = value.as_str().ok_or_else(|| {
        KernelError::internal("Stored encryption key is invalid", "value is not a string")
    })?;
    let raw = BASE64_STANDARD
        .decode(encoded)
        .map_err(|e| KernelError::internal("Stored encryption key is invalid", e))?;
    <[u8; KEY_LEN]>::try_from(raw.as_slice()).map_err(|_| {
        KernelError::internal(
            "Stored encryption key is invalid",
            format!("expected {} bytes, got {}", KEY_LEN, raw.len()),
        )
    })
}

/// Lazily creates and then serves the backup encryption key
#[derive(Clone)]
pub struct KeyManager {
    config: ConfigStore,
}

impl KeyManager {
    pub fn new(config: ConfigStore) -> Self {
        Self { config }
    }

    /// The existing key; never generates one
    pub async fn load_encryption_key(&self) -> KernelResult<[u8; KEY_LEN]> {
        match self.config.find_config(ENCRYPTION_KEY_CONFIG_KEY).await? {
            Some(entry) => decode_key(&entry.value),
            None => Err(KernelError::internal(
                "Backup encryption key is missing",
                format!("no value stored under {}", ENCRYPTION_KEY_CONFIG_KEY),
            )),
        }
    }

    pub async fn get_or_generate_encryption_key(&self, actor: &Actor) -> KernelResult<[u8; KEY_LEN]> {
        if let Some(entry) = self.config.find_config(ENCRYPTION_KEY_CONFIG_KEY).await? {
            return decode_key(&entry.value);
        }

        let key = generate_key();
        let input = SetConfigInput {
            key: ENCRYPTION_KEY_CONFIG_KEY.to_string(),
            value: Value::String(BASE64_STANDARD.encode(key)),
            description: Some("Backup encryption key".to_string()),
        };
        let details = json!({ "algorithm": ALGORITHM, "keyLength": KEY_LEN });

        match self.config.create_config(input, actor, details).await {
            Ok(_) => {
                info!("[BACKUP] Generated new backup encryption key ({})", ALGORITHM);
                Ok(key)
            }
            // Lost a race with a concurrent generator; use theirs
            Err(e) if e.code() == ErrorCode::Conflict => {
                let entry = self.config.get_config(ENCRYPTION_KEY_CONFIG_KEY).await?;
                decode_key(&entry.value)
            }
            Err(e) => Err(e),
        }
    }
}
