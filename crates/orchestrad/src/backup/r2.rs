//! Cloudflare R2 (S3-compatible) object store with SigV4 request signing

use crate::backup::storage::ObjectStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use orchestra_common::{KernelError, KernelResult, StorageProvider};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const REGION: &str = "auto";
const SERVICE: &str = "s3";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

#[derive(Clone)]
pub struct R2Config {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub endpoint: Option<String>,
}

impl fmt::Debug for R2Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("R2Config")
            .field("account_id", &self.account_id)
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl R2Config {
    /// Present only when account, both credentials and bucket are all set
    pub fn from_env() -> Option<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Some(Self {
            account_id: var("ORCHESTRA_R2_ACCOUNT_ID")?,
            access_key_id: var("ORCHESTRA_R2_ACCESS_KEY_ID")?,
            secret_access_key: var("ORCHESTRA_R2_SECRET_ACCESS_KEY")?,
            bucket: var("ORCHESTRA_R2_BUCKET")?,
            endpoint: var("ORCHESTRA_R2_ENDPOINT"),
        })
    }

    pub fn endpoint_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.r2.cloudflarestorage.com", self.account_id),
        }
    }

    /// Where an object lives. Any path on the endpoint is kept in front of
    /// `/{bucket}/{key}`, both in the URL and in what gets signed.
    pub(crate) fn object_target(&self, object_key: &str) -> KernelResult<ObjectTarget> {
        let base = reqwest::Url::parse(&self.endpoint_url())
            .map_err(|e| KernelError::internal("Invalid object store endpoint", e))?;
        let host = match (base.host_str(), base.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(KernelError::internal(
                    "Invalid object store endpoint",
                    "endpoint has no host",
                ))
            }
        };

        // Url::path is already percent-encoded
        let prefix = base.path().trim_end_matches('/');
        let canonical_uri = format!(
            "{}{}",
            prefix,
            encode_path(&format!("/{}/{}", self.bucket, object_key))
        );
        let url = format!("{}://{}{}", base.scheme(), host, canonical_uri);
        Ok(ObjectTarget {
            host,
            canonical_uri,
            url,
        })
    }
}

pub(crate) struct ObjectTarget {
    pub host: String,
    pub canonical_uri: String,
    pub url: String,
}

// ============================================================================
// SigV4
// ============================================================================

fn hmac_sha256(key: &[u8], data: &[u8]) -> KernelResult<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| KernelError::internal("Failed to initialise HMAC", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub(crate) fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> KernelResult<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of an object path, keeping `/` separators
pub(crate) fn encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

pub(crate) struct SignedRequest {
    pub amz_date: String,
    pub payload_hash: String,
    pub authorization: String,
}

pub(crate) fn sign_request(
    config: &R2Config,
    method: &str,
    host: &str,
    canonical_uri: &str,
    payload: &[u8],
    now: DateTime<Utc>,
) -> KernelResult<SignedRequest> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let payload_hash = sha256_hex(payload);

    let canonical_request = format!(
        "{}\n{}\n\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
        method, canonical_uri, host, payload_hash, amz_date, SIGNED_HEADERS, payload_hash
    );
    let scope = format!("{}/{}/{}/aws4_request", date, REGION, SERVICE);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(&config.secret_access_key, &date, REGION, SERVICE)?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    Ok(SignedRequest {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            config.access_key_id, scope, SIGNED_HEADERS, signature
        ),
        amz_date,
        payload_hash,
    })
}

// ============================================================================
// Store
// ============================================================================

pub struct R2Store {
    client: reqwest::Client,
    config: R2Config,
    timeout: Duration,
}

impl R2Store {
    pub fn new(client: reqwest::Client, config: R2Config, timeout: Duration) -> Self {
        Self {
            client,
            config,
            timeout,
        }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        object_key: &str,
        payload: Vec<u8>,
    ) -> KernelResult<reqwest::Response> {
        let target = self.config.object_target(object_key)?;
        let signed = sign_request(
            &self.config,
            method.as_str(),
            &target.host,
            &target.canonical_uri,
            &payload,
            Utc::now(),
        )?;
        debug!("[BACKUP] {} {}", method, target.url);

        self.client
            .request(method, &target.url)
            .timeout(self.timeout)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.payload_hash)
            .header("authorization", signed.authorization)
            .body(payload)
            .send()
            .await
            .map_err(|e| KernelError::internal("Object store request failed", e))
    }
}

fn ensure_success(response: &reqwest::Response, operation: &str) -> KernelResult<()> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(KernelError::internal(
            format!("Object store {} failed", operation),
            format!("HTTP {}", response.status().as_u16()),
        ))
    }
}

#[async_trait]
impl ObjectStore for R2Store {
    fn provider(&self) -> StorageProvider {
        StorageProvider::R2
    }

    async fn put_object(&self, key: &str, bytes: &[u8]) -> KernelResult<()> {
        let response = self.send(reqwest::Method::PUT, key, bytes.to_vec()).await?;
        ensure_success(&response, "upload")
    }

    async fn get_object(&self, key: &str) -> KernelResult<Vec<u8>> {
        let response = self.send(reqwest::Method::GET, key, Vec::new()).await?;
        ensure_success(&response, "download")?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| KernelError::internal("Object store download failed", e))?;
        Ok(bytes.to_vec())
    }

    async fn delete_object(&self, key: &str) -> KernelResult<()> {
        let response = self.send(reqwest::Method::DELETE, key, Vec::new()).await?;
        // S3 answers 204 for deletes, including of absent keys
        ensure_success(&response, "delete")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> R2Config {
        R2Config {
            account_id: "acct".to_string(),
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            bucket: "kernel".to_string(),
            endpoint: None,
        }
    }

    #[test]
    fn test_signing_key_derivation() {
        // Published SigV4 key-derivation example
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_empty_payload_hash() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_authorization_header_shape() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let signed = sign_request(
            &config(),
            "PUT",
            "acct.r2.cloudflarestorage.com",
            "/kernel/kernel-backups/a.bin",
            b"payload",
            now,
        )
        .unwrap();
        assert_eq!(signed.amz_date, "20260301T123000Z");
        assert!(signed
            .authorization
            .starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20260301/auto/s3/aws4_request, "));
        assert!(signed.authorization.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));

        // Deterministic for identical inputs, sensitive to the payload
        let again = sign_request(&config(), "PUT", "acct.r2.cloudflarestorage.com", "/kernel/kernel-backups/a.bin", b"payload", now).unwrap();
        assert_eq!(signed.authorization, again.authorization);
        let other = sign_request(&config(), "PUT", "acct.r2.cloudflarestorage.com", "/kernel/kernel-backups/a.bin", b"other", now).unwrap();
        assert_ne!(signed.authorization, other.authorization);
    }

    #[test]
    fn test_path_encoding_keeps_separators() {
        assert_eq!(encode_path("/kernel/a b/c+d.bin"), "/kernel/a%20b/c%2Bd.bin");
        assert_eq!(encode_path("/kernel/backup-1_x.~bin"), "/kernel/backup-1_x.~bin");
    }

    #[test]
    fn test_debug_hides_secret() {
        let text = format!("{:?}", config());
        assert!(!text.contains("EXAMPLEKEY"));
        assert!(text.contains("kernel"));
    }

    #[test]
    fn test_default_endpoint_uses_account() {
        assert_eq!(config().endpoint_url(), "https://acct.r2.cloudflarestorage.com");
        let mut custom = config();
        custom.endpoint = Some("http://127.0.0.1:9000/".to_string());
        assert_eq!(custom.endpoint_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_object_target_keeps_endpoint_path() {
        let target = config().object_target("kernel-backups/a b.bin").unwrap();
        assert_eq!(target.host, "acct.r2.cloudflarestorage.com");
        assert_eq!(target.canonical_uri, "/kernel/kernel-backups/a%20b.bin");
        assert_eq!(
            target.url,
            "https://acct.r2.cloudflarestorage.com/kernel/kernel-backups/a%20b.bin"
        );

        let mut proxied = config();
        proxied.endpoint = Some("http://127.0.0.1:9000/storage/".to_string());
        let target = proxied.object_target("kernel-backups/a.bin").unwrap();
        assert_eq!(target.host, "127.0.0.1:9000");
        assert_eq!(target.canonical_uri, "/storage/kernel/kernel-backups/a.bin");
        assert_eq!(target.url, "http://127.0.0.1:9000/storage/kernel/kernel-backups/a.bin");
    }
}
