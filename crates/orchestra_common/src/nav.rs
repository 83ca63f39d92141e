//! Navigation manifest schema and the merged nav tree
//!
//! Each registered service exposes `GET /api/manifest`. The kernel validates
//! the body against the v1 schema below, filters items by the caller's
//! capabilities, and merges everything into a `NavTree`.

use crate::types::{HealthStatus, HealthSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MANIFEST_PATH: &str = "/api/manifest";
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    MANIFEST_SCHEMA_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavItem {
    pub label: String,
    pub href: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub label: String,
    pub items: Vec<NavItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavManifest {
    #[serde(default = "default_schema_version")]
    pub version: u32,
    pub service_id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub groups: Vec<NavGroup>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ManifestError {
    #[error("manifest does not match schema: {0}")]
    Shape(String),

    #[error("unsupported manifest version {0}")]
    UnsupportedVersion(u32),

    #[error("manifest field '{0}' must not be empty")]
    EmptyField(String),

    #[error("manifest href '{0}' must be a relative path or an http(s) URL")]
    InvalidHref(String),

    #[error("manifest serviceId '{found}' does not match service '{expected}'")]
    ServiceMismatch { expected: String, found: String },
}

impl NavManifest {
    /// Parse and validate a manifest body.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ManifestError> {
        let manifest: NavManifest =
            serde_json::from_value(value).map_err(|e| ManifestError::Shape(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// A service may only publish navigation under its own id
    pub fn check_owner(&self, service_id: &str) -> Result<(), ManifestError> {
        if self.service_id == service_id {
            Ok(())
        } else {
            Err(ManifestError::ServiceMismatch {
                expected: service_id.to_string(),
                found: self.service_id.clone(),
            })
        }
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.version != MANIFEST_SCHEMA_VERSION {
            return Err(ManifestError::UnsupportedVersion(self.version));
        }
        if self.service_id.trim().is_empty() {
            return Err(ManifestError::EmptyField("serviceId".to_string()));
        }
        for (gi, group) in self.groups.iter().enumerate() {
            if group.label.trim().is_empty() {
                return Err(ManifestError::EmptyField(format!("groups[{}].label", gi)));
            }
            for (ii, item) in group.items.iter().enumerate() {
                if item.label.trim().is_empty() {
                    return Err(ManifestError::EmptyField(format!(
                        "groups[{}].items[{}].label",
                        gi, ii
                    )));
                }
                let href = item.href.trim();
                if href.is_empty() {
                    return Err(ManifestError::EmptyField(format!(
                        "groups[{}].items[{}].href",
                        gi, ii
                    )));
                }
                if !(href.starts_with('/')
                    || href.starts_with("http://")
                    || href.starts_with("https://"))
                {
                    return Err(ManifestError::InvalidHref(item.href.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Keep items with no capability requirement or whose capability the caller
/// holds; drop groups left empty. An empty capability list disables filtering.
pub fn filter_groups(groups: Vec<NavGroup>, capabilities: &[String]) -> Vec<NavGroup> {
    if capabilities.is_empty() {
        return groups;
    }
    groups
        .into_iter()
        .filter_map(|mut group| {
            group.items.retain(|item| match &item.capability {
                None => true,
                Some(cap) => capabilities.iter().any(|c| c == cap),
            });
            if group.items.is_empty() {
                None
            } else {
                Some(group)
            }
        })
        .collect()
}

/// Caller identity for nav filtering
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavUser {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavServiceEntry {
    pub id: String,
    pub label: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub groups: Vec<NavGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavTree {
    pub services: Vec<NavServiceEntry>,
    pub user: Option<NavUser>,
    pub tenant: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellServiceStatus {
    pub id: String,
    pub status: HealthStatus,
    /// Manifest fetches for this service are currently being skipped
    #[serde(default)]
    pub breaker_open: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellHealth {
    pub status: HealthStatus,
    pub summary: HealthSummary,
    pub services: Vec<ShellServiceStatus>,
    pub timestamp: DateTime<Utc>,
}
