//! HTTP client for calls into registered services
//!
//! One shared reqwest client; every call carries its own timeout so a hung
//! service never outlives the budget of the sweep it belongs to.

use orchestra_common::{KernelError, KernelResult};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Outcome label for a downstream request, used as a metrics label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    NetworkError,
    Timeout,
    Http4xx,
    Http5xx,
    InvalidBody,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::Http4xx => "http_4xx",
            Self::Http5xx => "http_5xx",
            Self::InvalidBody => "invalid_body",
        }
    }

    pub fn from_http(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            500..=599 => Self::Http5xx,
            _ => Self::Http4xx,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DownstreamError {
    #[error("Request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("{0}")]
    Network(String),
}

impl DownstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn status(&self) -> RequestStatus {
        match self {
            Self::Timeout { .. } => RequestStatus::Timeout,
            Self::Network(_) => RequestStatus::NetworkError,
        }
    }

    pub(crate) fn classify(err: &reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                after_ms: timeout.as_millis() as u64,
            }
        } else if err.is_connect() {
            Self::Network(format!("Connection failed: {}", err))
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[derive(Clone)]
pub struct DownstreamClient {
    client: reqwest::Client,
}

impl DownstreamClient {
    pub fn new() -> KernelResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("orchestrad/", env!("CARGO_PKG_VERSION")))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| KernelError::internal("Failed to build HTTP client", e))?;
        Ok(Self { client })
    }

    pub async fn get(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<reqwest::Response, DownstreamError> {
        debug!("GET {} (timeout {}ms)", url, timeout.as_millis());
        self.client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| DownstreamError::classify(&e, timeout))
    }

    /// POST with an optional JSON body
    pub async fn post(
        &self,
        url: &str,
        body: Option<&serde_json::Value>,
        timeout: Duration,
    ) -> Result<reqwest::Response, DownstreamError> {
        debug!("POST {} (timeout {}ms)", url, timeout.as_millis());
        let mut request = self.client.post(url).timeout(timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| DownstreamError::classify(&e, timeout))
    }

    /// Borrow the raw client (used by the object store)
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_labels() {
        assert_eq!(RequestStatus::from_http(204), RequestStatus::Success);
        assert_eq!(RequestStatus::from_http(503), RequestStatus::Http5xx);
        assert_eq!(RequestStatus::from_http(404), RequestStatus::Http4xx);
        assert_eq!(RequestStatus::from_http(302), RequestStatus::Http4xx);
    }

    #[test]
    fn test_timeout_message_carries_budget() {
        let err = DownstreamError::Timeout { after_ms: 5000 };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Request timed out after 5000ms");
        assert_eq!(err.status().as_str(), "timeout");
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = DownstreamClient::new().unwrap();
        let err = client
            .get(&format!("http://{}/health", addr), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(!err.is_timeout());
        assert_eq!(err.status(), RequestStatus::NetworkError);
    }
}
