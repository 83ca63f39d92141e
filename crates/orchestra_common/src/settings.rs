//! Admin config store types
//!
//! Values are schema-agnostic JSON; callers validate semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Config key holding the base64 backup encryption key
pub const ENCRYPTION_KEY_CONFIG_KEY: &str = "system.backup.encryption_key";

pub const MAX_CONFIG_KEY_LEN: usize = 255;

/// Serialized values larger than this are rejected
pub const MAX_CONFIG_VALUE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigHistoryEntry {
    pub id: i64,
    pub config_key: String,
    pub old_value: serde_json::Value,
    pub new_value: serde_json::Value,
    pub changed_by: String,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConfigInput {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub description: Option<String>,
}

impl SetConfigInput {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
            description: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConfigOutcome {
    pub entry: ConfigEntry,
    /// True when the key did not exist before the call
    pub created: bool,
}

impl SetConfigOutcome {
    pub fn message(&self) -> String {
        if self.created {
            format!("Config '{}' created", self.entry.key)
        } else {
            format!("Config '{}' updated", self.entry.key)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSetOutcome {
    pub processed: u32,
    pub failed: Vec<String>,
}

/// Keys whose values must never reach logs or audit details.
pub fn is_sensitive_key(key: &str) -> bool {
    if key == ENCRYPTION_KEY_CONFIG_KEY {
        return true;
    }
    let lower = key.to_ascii_lowercase();
    ["secret", "password", "token", "private_key", "encryption_key"]
        .iter()
        .any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensitive_keys() {
        assert!(is_sensitive_key(ENCRYPTION_KEY_CONFIG_KEY));
        assert!(is_sensitive_key("integrations.slack.token"));
        assert!(is_sensitive_key("smtp.PASSWORD"));
        assert!(!is_sensitive_key("ui.theme"));
    }

    #[test]
    fn test_outcome_message_depends_on_creation() {
        let now = Utc::now();
        let entry = ConfigEntry {
            key: "ui.theme".to_string(),
            value: json!("dark"),
            description: None,
            created_at: now,
            updated_at: now,
            updated_by: "system".to_string(),
        };
        let created = SetConfigOutcome { entry: entry.clone(), created: true };
        let updated = SetConfigOutcome { entry, created: false };
        assert!(created.message().ends_with("created"));
        assert!(updated.message().ends_with("updated"));
    }
}
