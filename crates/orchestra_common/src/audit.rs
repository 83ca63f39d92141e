//! Audit event vocabulary and entry types
//!
//! The event type set is closed; the strings are part of the wire contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEventType {
    #[serde(rename = "service.registered")]
    ServiceRegistered,
    #[serde(rename = "service.unregistered")]
    ServiceUnregistered,
    #[serde(rename = "service.health_changed")]
    ServiceHealthChanged,
    #[serde(rename = "service.updated")]
    ServiceUpdated,
    #[serde(rename = "config.set")]
    ConfigSet,
    #[serde(rename = "config.created")]
    ConfigCreated,
    #[serde(rename = "config.updated")]
    ConfigUpdated,
    #[serde(rename = "config.deleted")]
    ConfigDeleted,
    #[serde(rename = "backup.started")]
    BackupStarted,
    #[serde(rename = "backup.completed")]
    BackupCompleted,
    #[serde(rename = "backup.failed")]
    BackupFailed,
    #[serde(rename = "restore.started")]
    RestoreStarted,
    #[serde(rename = "restore.completed")]
    RestoreCompleted,
    #[serde(rename = "restore.failed")]
    RestoreFailed,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 14] = [
        Self::ServiceRegistered,
        Self::ServiceUnregistered,
        Self::ServiceHealthChanged,
        Self::ServiceUpdated,
        Self::ConfigSet,
        Self::ConfigCreated,
        Self::ConfigUpdated,
        Self::ConfigDeleted,
        Self::BackupStarted,
        Self::BackupCompleted,
        Self::BackupFailed,
        Self::RestoreStarted,
        Self::RestoreCompleted,
        Self::RestoreFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceRegistered => "service.registered",
            Self::ServiceUnregistered => "service.unregistered",
            Self::ServiceHealthChanged => "service.health_changed",
            Self::ServiceUpdated => "service.updated",
            Self::ConfigSet => "config.set",
            Self::ConfigCreated => "config.created",
            Self::ConfigUpdated => "config.updated",
            Self::ConfigDeleted => "config.deleted",
            Self::BackupStarted => "backup.started",
            Self::BackupCompleted => "backup.completed",
            Self::BackupFailed => "backup.failed",
            Self::RestoreStarted => "restore.started",
            Self::RestoreCompleted => "restore.completed",
            Self::RestoreFailed => "restore.failed",
        }
    }
}

impl FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown audit event type '{}'", s))
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    User,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }
}

/// Who is performing an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub kind: ActorType,
    pub trace_id: Option<String>,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            id: "system".to_string(),
            kind: ActorType::System,
            trace_id: None,
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ActorType::User,
            trace_id: None,
        }
    }

    pub fn with_trace(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }
}

impl Default for Actor {
    fn default() -> Self {
        Self::system()
    }
}

/// Stored audit log row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub event_type: AuditEventType,
    pub entity_type: String,
    pub entity_id: String,
    pub actor_id: String,
    pub actor_type: ActorType,
    pub details: Option<serde_json::Value>,
    pub previous_values: Option<serde_json::Value>,
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    /// Create a new audit entry attributed to `actor`
    pub fn new(
        event_type: AuditEventType,
        entity_type: &str,
        entity_id: &str,
        actor: &Actor,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            actor_id: actor.id.clone(),
            actor_type: actor.kind,
            details: None,
            previous_values: None,
            trace_id: actor.trace_id.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_previous(mut self, previous: serde_json::Value) -> Self {
        self.previous_values = Some(previous);
        self
    }
}

/// Filter for reading back the audit trail
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub event_type: Option<AuditEventType>,
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types_round_trip_as_strings() {
        for event in AuditEventType::ALL {
            let json = serde_json::to_string(&event).unwrap();
            assert_eq!(json, format!("\"{}\"", event.as_str()));
            assert_eq!(event.as_str().parse::<AuditEventType>().unwrap(), event);
        }
    }

    #[test]
    fn test_entry_inherits_actor() {
        let actor = Actor::user("alice").with_trace(Some("t-42".to_string()));
        let entry = AuditLogEntry::new(AuditEventType::ServiceRegistered, "service", "billing", &actor);
        assert_eq!(entry.actor_id, "alice");
        assert_eq!(entry.actor_type, ActorType::User);
        assert_eq!(entry.trace_id.as_deref(), Some("t-42"));
    }

    #[test]
    fn test_entry_ids_are_unique() {
        let actor = Actor::system();
        let a = AuditLogEntry::new(AuditEventType::ConfigSet, "config", "k", &actor);
        let b = AuditLogEntry::new(AuditEventType::ConfigSet, "config", "k", &actor);
        assert_ne!(a.id, b.id);
    }
}
