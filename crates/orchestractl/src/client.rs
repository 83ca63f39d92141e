//! HTTP client for the orchestrad API.

use anyhow::{anyhow, Context, Result};
use orchestra_common::Envelope;
use reqwest::{Method, Url};
use serde_json::Value;
use std::time::Duration;

/// Default daemon address, matching orchestrad's default bind
pub const DEFAULT_URL: &str = "http://127.0.0.1:7870";

const ACTOR_HEADER: &str = "x-actor-id";

/// Restores can wait on every downstream service
const REQUEST_TIMEOUT: Duration = Duration::from_secs(130);

pub struct KernelClient {
    http: reqwest::Client,
    base: Url,
    actor: Option<String>,
}

impl KernelClient {
    pub fn new(base: &str, actor: Option<String>) -> Result<Self> {
        let base = Url::parse(base).with_context(|| format!("invalid kernel URL '{}'", base))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("kernel URL '{}' cannot be used as a base", base));
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("orchestractl/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, base, actor })
    }

    /// Build `base/segments...?query`; segments are percent-encoded individually
    fn url(&self, segments: &[&str], query: &[(&str, String)]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        url
    }

    pub async fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Envelope<Value>> {
        let url = self.url(segments, query);
        let mut request = self.http.request(method.clone(), url.clone());
        if let Some(actor) = &self.actor {
            request = request.header(ACTOR_HEADER, actor);
        }
        if let Some(body) = &body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            anyhow!(
                "Cannot reach orchestrad at {}: {}\n\n\
                 Is the daemon running? Point at another instance with --url or ORCHESTRA_URL.",
                self.base,
                e
            )
        })?;

        let status = response.status();
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|_| {
            anyhow!(
                "{} {} returned HTTP {} without an envelope",
                method,
                url.path(),
                status.as_u16()
            )
        })
    }

    pub async fn get(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Envelope<Value>> {
        self.request(Method::GET, segments, query, None).await
    }

    pub async fn post(&self, segments: &[&str], body: Option<Value>) -> Result<Envelope<Value>> {
        self.request(Method::POST, segments, &[], body).await
    }

    pub async fn put(&self, segments: &[&str], body: Value) -> Result<Envelope<Value>> {
        self.request(Method::PUT, segments, &[], Some(body)).await
    }

    pub async fn delete(&self, segments: &[&str]) -> Result<Envelope<Value>> {
        self.request(Method::DELETE, segments, &[], None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let client = KernelClient::new("http://localhost:7870/", None).unwrap();
        let url = client.url(&["v1", "config", "smtp/host"], &[("limit", "5".to_string())]);
        assert_eq!(url.as_str(), "http://localhost:7870/v1/config/smtp%2Fhost?limit=5");

        let url = client.url(&["v1", "health"], &[]);
        assert_eq!(url.as_str(), "http://localhost:7870/v1/health");
    }

    #[test]
    fn test_rejects_bad_base() {
        assert!(KernelClient::new("not a url", None).is_err());
        assert!(KernelClient::new("mailto:ops@example.com", None).is_err());
    }
}
