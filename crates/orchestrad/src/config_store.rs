//! Admin config store - schema-agnostic JSON values with change history
//!
//! An upsert, its history row and its audit row commit in one transaction.
//! Values under sensitive keys never reach audit details or logs.

use crate::audit::insert_entry;
use crate::db::{conflict_or_internal, json_column, KernelDb};
use crate::registry::wrap_internal;
use chrono::{DateTime, Utc};
use orchestra_common::*;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use tracing::{info, warn};

pub const REDACTED: &str = "[REDACTED]";
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

pub fn validate_config_key(key: &str) -> KernelResult<()> {
    if key.is_empty() || key.len() > MAX_CONFIG_KEY_LEN {
        return Err(KernelError::validation(format!(
            "config key must be 1-{} characters",
            MAX_CONFIG_KEY_LEN
        )));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(KernelError::validation(format!(
            "config key '{}' must not contain whitespace",
            key
        )));
    }
    Ok(())
}

fn encode_value(key: &str, value: &Value) -> KernelResult<String> {
    let encoded = serde_json::to_string(value)?;
    if encoded.len() > MAX_CONFIG_VALUE_BYTES {
        return Err(KernelError::validation(format!(
            "value for '{}' is {} bytes, limit is {}",
            key,
            encoded.len(),
            MAX_CONFIG_VALUE_BYTES
        )));
    }
    Ok(encoded)
}

/// Value as it may appear in audit details
fn audit_value(key: &str, value: &Value) -> Value {
    if is_sensitive_key(key) {
        Value::String(REDACTED.to_string())
    } else {
        value.clone()
    }
}

/// Copy of `entry` safe to hand to API callers
pub fn redacted(mut entry: ConfigEntry) -> ConfigEntry {
    if is_sensitive_key(&entry.key) {
        entry.value = Value::String(REDACTED.to_string());
    }
    entry
}

struct RawConfigRow {
    key: String,
    value: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    updated_by: String,
}

impl RawConfigRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            value: row.get(1)?,
            description: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            updated_by: row.get(5)?,
        })
    }

    fn into_entry(self) -> KernelResult<ConfigEntry> {
        Ok(ConfigEntry {
            value: json_column(&self.value, "value")?,
            key: self.key,
            description: self.description,
            created_at: self.created_at,
            updated_at: self.updated_at,
            updated_by: self.updated_by,
        })
    }
}

pub(crate) fn load_config(conn: &Connection, key: &str) -> KernelResult<Option<ConfigEntry>> {
    conn.query_row(
        "SELECT key, value, description, created_at, updated_at, updated_by
         FROM config_entries WHERE key = ?1",
        params![key],
        RawConfigRow::from_row,
    )
    .optional()?
    .map(RawConfigRow::into_entry)
    .transpose()
}

pub(crate) fn load_all_configs(conn: &Connection) -> KernelResult<Vec<ConfigEntry>> {
    let mut stmt = conn.prepare(
        "SELECT key, value, description, created_at, updated_at, updated_by
         FROM config_entries ORDER BY key",
    )?;
    let rows = stmt.query_map([], RawConfigRow::from_row)?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?.into_entry()?);
    }
    Ok(entries)
}

/// Upsert without history or audit; used by kernel restore
pub(crate) fn write_config(conn: &Connection, entry: &ConfigEntry) -> KernelResult<()> {
    conn.execute(
        "INSERT INTO config_entries (key, value, description, created_at, updated_at, updated_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(key) DO UPDATE SET
             value = excluded.value, description = excluded.description,
             updated_at = excluded.updated_at, updated_by = excluded.updated_by",
        params![
            entry.key,
            serde_json::to_string(&entry.value)?,
            entry.description,
            entry.created_at,
            entry.updated_at,
            entry.updated_by,
        ],
    )?;
    Ok(())
}

#[derive(Clone)]
pub struct ConfigStore {
    db: KernelDb,
}

impl ConfigStore {
    pub fn new(db: KernelDb) -> Self {
        Self { db }
    }

    pub async fn get_config(&self, key: &str) -> KernelResult<ConfigEntry> {
        let lookup = key.to_string();
        self.db
            .execute(move |conn| load_config(conn, &lookup))
            .await
            .map_err(|e| wrap_internal(e, "Failed to read config"))?
            .ok_or_else(|| KernelError::not_found(format!("Config not found: {}", key)))
    }

    /// Like `get_config`, but absence is not an error
    pub async fn find_config(&self, key: &str) -> KernelResult<Option<ConfigEntry>> {
        let lookup = key.to_string();
        self.db
            .execute(move |conn| load_config(conn, &lookup))
            .await
            .map_err(|e| wrap_internal(e, "Failed to read config"))
    }

    pub async fn set_config(
        &self,
        input: SetConfigInput,
        actor: &Actor,
    ) -> KernelResult<SetConfigOutcome> {
        validate_config_key(&input.key)?;
        let encoded = encode_value(&input.key, &input.value)?;
        let actor = actor.clone();

        let outcome = self
            .db
            .transaction(move |tx| {
                let now = Utc::now();
                let existing = load_config(tx, &input.key)?;

                let entry = match &existing {
                    Some(current) => {
                        let entry = ConfigEntry {
                            key: input.key.clone(),
                            value: input.value.clone(),
                            description: input.description.clone().or_else(|| current.description.clone()),
                            created_at: current.created_at,
                            updated_at: now,
                            updated_by: actor.id.clone(),
                        };
                        tx.execute(
                            "UPDATE config_entries
                             SET value = ?2, description = ?3, updated_at = ?4, updated_by = ?5
                             WHERE key = ?1",
                            params![entry.key, encoded, entry.description, now, entry.updated_by],
                        )?;
                        tx.execute(
                            "INSERT INTO config_history (config_key, old_value, new_value, changed_by, changed_at)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            params![
                                entry.key,
                                serde_json::to_string(&current.value)?,
                                encoded,
                                actor.id,
                                now,
                            ],
                        )?;
                        entry
                    }
                    None => {
                        let entry = ConfigEntry {
                            key: input.key.clone(),
                            value: input.value.clone(),
                            description: input.description.clone(),
                            created_at: now,
                            updated_at: now,
                            updated_by: actor.id.clone(),
                        };
                        tx.execute(
                            "INSERT INTO config_entries (key, value, description, created_at, updated_at, updated_by)
                             VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
                            params![entry.key, encoded, entry.description, now, entry.updated_by],
                        )?;
                        entry
                    }
                };

                let mut audit = AuditLogEntry::new(AuditEventType::ConfigSet, "config", &entry.key, &actor)
                    .with_details(json!({
                        "key": entry.key,
                        "created": existing.is_none(),
                        "value": audit_value(&entry.key, &entry.value),
                    }));
                if let Some(current) = &existing {
                    audit = audit.with_previous(json!({
                        "value": audit_value(&current.key, &current.value),
                    }));
                }
                insert_entry(tx, &audit)?;

                Ok(SetConfigOutcome {
                    entry,
                    created: existing.is_none(),
                })
            })
            .await
            .map_err(|e| wrap_internal(e, "Failed to set config"))?;

        info!("[CONFIG] {}", outcome.message());
        Ok(outcome)
    }

    /// Insert a key that must not exist yet. Audited as `config.created`
    /// with caller-supplied details instead of the value.
    pub async fn create_config(
        &self,
        input: SetConfigInput,
        actor: &Actor,
        audit_details: Value,
    ) -> KernelResult<ConfigEntry> {
        validate_config_key(&input.key)?;
        let encoded = encode_value(&input.key, &input.value)?;
        let actor = actor.clone();

        let entry = self
            .db
            .transaction(move |tx| {
                let now = Utc::now();
                let entry = ConfigEntry {
                    key: input.key,
                    value: input.value,
                    description: input.description,
                    created_at: now,
                    updated_at: now,
                    updated_by: actor.id.clone(),
                };
                tx.execute(
                    "INSERT INTO config_entries (key, value, description, created_at, updated_at, updated_by)
                     VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
                    params![entry.key, encoded, entry.description, now, entry.updated_by],
                )
                .map_err(|e| conflict_or_internal(e, format!("Config already exists: {}", entry.key)))?;

                let audit = AuditLogEntry::new(AuditEventType::ConfigCreated, "config", &entry.key, &actor)
                    .with_details(audit_details);
                insert_entry(tx, &audit)?;
                Ok(entry)
            })
            .await
            .map_err(|e| wrap_internal(e, "Failed to create config"))?;

        info!("[CONFIG] Config '{}' created", entry.key);
        Ok(entry)
    }

    pub async fn delete_config(&self, key: &str, actor: &Actor) -> KernelResult<ConfigEntry> {
        let lookup = key.to_string();
        let actor = actor.clone();
        let removed = self
            .db
            .transaction(move |tx| {
                let current = load_config(tx, &lookup)?
                    .ok_or_else(|| KernelError::not_found(format!("Config not found: {}", lookup)))?;
                tx.execute("DELETE FROM config_entries WHERE key = ?1", params![lookup])?;

                let audit = AuditLogEntry::new(AuditEventType::ConfigDeleted, "config", &lookup, &actor)
                    .with_previous(json!({
                        "value": audit_value(&current.key, &current.value),
                        "description": current.description,
                    }));
                insert_entry(tx, &audit)?;
                Ok(current)
            })
            .await
            .map_err(|e| wrap_internal(e, "Failed to delete config"))?;

        info!("[CONFIG] Config '{}' deleted", removed.key);
        Ok(removed)
    }

    /// Alphabetical by key, optionally filtered by a case-insensitive prefix
    pub async fn list_configs(&self, prefix: Option<&str>) -> KernelResult<Vec<ConfigEntry>> {
        let entries = self
            .db
            .execute(load_all_configs)
            .await
            .map_err(|e| wrap_internal(e, "Failed to list configs"))?;

        Ok(match prefix.filter(|p| !p.is_empty()) {
            Some(prefix) => {
                let prefix = prefix.to_lowercase();
                entries
                    .into_iter()
                    .filter(|e| e.key.to_lowercase().starts_with(&prefix))
                    .collect()
            }
            None => entries,
        })
    }

    /// Sequential `set_config` per entry; failures are collected, never raised
    pub async fn bulk_set_configs(
        &self,
        entries: Vec<SetConfigInput>,
        actor: &Actor,
    ) -> BulkSetOutcome {
        let mut outcome = BulkSetOutcome::default();
        for input in entries {
            let key = input.key.clone();
            match self.set_config(input, actor).await {
                Ok(_) => outcome.processed += 1,
                Err(e) => {
                    warn!("[CONFIG] Bulk set failed for '{}': {}", key, e);
                    outcome.failed.push(key);
                }
            }
        }
        outcome
    }

    /// Newest first
    pub async fn get_config_history(
        &self,
        key: &str,
        limit: Option<u32>,
    ) -> KernelResult<Vec<ConfigHistoryEntry>> {
        let lookup = key.to_string();
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 1000);
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, config_key, old_value, new_value, changed_by, changed_at
                     FROM config_history WHERE config_key = ?1
                     ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![lookup, limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, DateTime<Utc>>(5)?,
                    ))
                })?;

                let mut history = Vec::new();
                for row in rows {
                    let (id, config_key, old_value, new_value, changed_by, changed_at) = row?;
                    history.push(ConfigHistoryEntry {
                        id,
                        config_key,
                        old_value: json_column(&old_value, "old_value")?,
                        new_value: json_column(&new_value, "new_value")?,
                        changed_by,
                        changed_at,
                    });
                }
                Ok(history)
            })
            .await
            .map_err(|e| wrap_internal(e, "Failed to read config history"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;

    async fn store() -> (ConfigStore, AuditLog) {
        let db = KernelDb::open_in_memory().await.unwrap();
        (ConfigStore::new(db.clone()), AuditLog::new(db))
    }

    #[tokio::test]
    async fn test_first_set_creates_no_history() {
        let (store, _) = store().await;
        let outcome = store
            .set_config(SetConfigInput::new("ui.theme", json!("dark")), &Actor::user("alice"))
            .await
            .unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.message(), "Config 'ui.theme' created");
        assert!(store.get_config_history("ui.theme", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_each_update_adds_one_history_row() {
        let (store, audit) = store().await;
        let actor = Actor::user("alice");
        store
            .set_config(SetConfigInput::new("limits.max", json!(1)), &actor)
            .await
            .unwrap();
        let second = store
            .set_config(SetConfigInput::new("limits.max", json!(2)), &actor)
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.message(), "Config 'limits.max' updated");
        store
            .set_config(SetConfigInput::new("limits.max", json!({"value": 3})), &actor)
            .await
            .unwrap();

        let history = store.get_config_history("limits.max", None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].old_value, json!(2));
        assert_eq!(history[0].new_value, json!({"value": 3}));
        assert_eq!(history[1].old_value, json!(1));
        assert_eq!(history[1].new_value, json!(2));
        assert_eq!(history[1].changed_by, "alice");

        let stored = store.get_config("limits.max").await.unwrap();
        assert_eq!(stored.value, json!({"value": 3}));

        let sets = audit
            .list_entries(AuditFilter {
                event_type: Some(AuditEventType::ConfigSet),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(sets.len(), 3);
    }

    #[tokio::test]
    async fn test_sensitive_values_are_redacted_in_audit() {
        let (store, audit) = store().await;
        let actor = Actor::system();
        store
            .set_config(SetConfigInput::new("smtp.password", json!("hunter2")), &actor)
            .await
            .unwrap();
        store
            .set_config(SetConfigInput::new("smtp.password", json!("hunter3")), &actor)
            .await
            .unwrap();

        let entries = audit.list_entries(AuditFilter::default()).await.unwrap();
        for entry in entries {
            let text = serde_json::to_string(&entry).unwrap();
            assert!(!text.contains("hunter"));
        }
        let listed = store.list_configs(None).await.unwrap();
        assert_eq!(redacted(listed[0].clone()).value, json!(REDACTED));
    }

    #[tokio::test]
    async fn test_delete_and_not_found() {
        let (store, audit) = store().await;
        let actor = Actor::system();
        assert_eq!(
            store.get_config("missing").await.unwrap_err().code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            store.delete_config("missing", &actor).await.unwrap_err().code(),
            ErrorCode::NotFound
        );

        store
            .set_config(SetConfigInput::new("ui.theme", json!("dark")), &actor)
            .await
            .unwrap();
        let removed = store.delete_config("ui.theme", &actor).await.unwrap();
        assert_eq!(removed.value, json!("dark"));
        assert!(store.find_config("ui.theme").await.unwrap().is_none());

        let deleted = audit
            .list_entries(AuditFilter {
                event_type: Some(AuditEventType::ConfigDeleted),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(deleted[0].previous_values.as_ref().unwrap()["value"], json!("dark"));
    }

    #[tokio::test]
    async fn test_list_prefix_is_case_insensitive_and_sorted() {
        let (store, _) = store().await;
        let actor = Actor::system();
        for key in ["ui.theme", "UI.density", "auth.mode", "ui.accent"] {
            store
                .set_config(SetConfigInput::new(key, json!(true)), &actor)
                .await
                .unwrap();
        }
        let keys: Vec<String> = store
            .list_configs(Some("ui."))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["UI.density", "ui.accent", "ui.theme"]);
    }

    #[tokio::test]
    async fn test_bulk_set_reports_failed_keys() {
        let (store, _) = store().await;
        let oversized = json!("x".repeat(MAX_CONFIG_VALUE_BYTES + 1));
        let outcome = store
            .bulk_set_configs(
                vec![
                    SetConfigInput::new("key1", json!(1)),
                    SetConfigInput::new("key2", oversized),
                    SetConfigInput::new("key3", json!(3)),
                ],
                &Actor::system(),
            )
            .await;
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.failed, vec!["key2".to_string()]);
        assert!(store.find_config("key3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_config_conflicts_on_existing_key() {
        let (store, _) = store().await;
        let actor = Actor::system();
        store
            .create_config(SetConfigInput::new("feature.x", json!(1)), &actor, json!({}))
            .await
            .unwrap();
        let err = store
            .create_config(SetConfigInput::new("feature.x", json!(2)), &actor, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
    }
}
