//! Audit trail persistence
//!
//! Mutations insert their audit row through [`insert_entry`] on the same
//! transaction as the write itself. [`AuditLog`] covers standalone events
//! (backup/restore lifecycle) and reads.

use crate::db::{json_column, KernelDb};
use chrono::{DateTime, Utc};
use orchestra_common::{
    ActorType, AuditEventType, AuditFilter, AuditLogEntry, KernelError, KernelResult,
};
use rusqlite::{params, Connection, Row};
use tracing::debug;

pub const DEFAULT_AUDIT_LIMIT: u32 = 100;
pub const MAX_AUDIT_LIMIT: u32 = 500;

/// Insert one audit row on an existing connection or transaction
pub fn insert_entry(conn: &Connection, entry: &AuditLogEntry) -> KernelResult<()> {
    let details = entry.details.as_ref().map(serde_json::to_string).transpose()?;
    let previous = entry
        .previous_values
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO audit_log (id, event_type, entity_type, entity_id, actor_id, actor_type,
                                details, previous_values, trace_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.id,
            entry.event_type.as_str(),
            entry.entity_type,
            entry.entity_id,
            entry.actor_id,
            entry.actor_type.as_str(),
            details,
            previous,
            entry.trace_id,
            entry.created_at,
        ],
    )?;
    debug!(
        "Audit {} {}:{} by {}",
        entry.event_type, entry.entity_type, entry.entity_id, entry.actor_id
    );
    Ok(())
}

struct RawAuditRow {
    id: String,
    event_type: String,
    entity_type: String,
    entity_id: String,
    actor_id: String,
    actor_type: String,
    details: Option<String>,
    previous_values: Option<String>,
    trace_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl RawAuditRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            event_type: row.get(1)?,
            entity_type: row.get(2)?,
            entity_id: row.get(3)?,
            actor_id: row.get(4)?,
            actor_type: row.get(5)?,
            details: row.get(6)?,
            previous_values: row.get(7)?,
            trace_id: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_entry(self) -> KernelResult<AuditLogEntry> {
        let event_type = self
            .event_type
            .parse::<AuditEventType>()
            .map_err(|e| KernelError::internal("Corrupt audit row", e))?;
        let actor_type = match self.actor_type.as_str() {
            "user" => ActorType::User,
            _ => ActorType::System,
        };
        Ok(AuditLogEntry {
            id: self.id,
            event_type,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            actor_id: self.actor_id,
            actor_type,
            details: self
                .details
                .as_deref()
                .map(|raw| json_column(raw, "details"))
                .transpose()?,
            previous_values: self
                .previous_values
                .as_deref()
                .map(|raw| json_column(raw, "previous_values"))
                .transpose()?,
            trace_id: self.trace_id,
            created_at: self.created_at,
        })
    }
}

#[derive(Clone)]
pub struct AuditLog {
    db: KernelDb,
}

impl AuditLog {
    pub fn new(db: KernelDb) -> Self {
        Self { db }
    }

    /// Record a standalone audit event
    pub async fn record(&self, entry: AuditLogEntry) -> KernelResult<()> {
        self.db.execute(move |conn| insert_entry(conn, &entry)).await
    }

    /// Newest first, filtered by entity and/or event type
    pub async fn list_entries(&self, filter: AuditFilter) -> KernelResult<Vec<AuditLogEntry>> {
        let limit = filter.limit.unwrap_or(DEFAULT_AUDIT_LIMIT);
        if limit == 0 || limit > MAX_AUDIT_LIMIT {
            return Err(KernelError::validation(format!(
                "limit must be between 1 and {}",
                MAX_AUDIT_LIMIT
            )));
        }

        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, event_type, entity_type, entity_id, actor_id, actor_type,
                            details, previous_values, trace_id, created_at
                     FROM audit_log
                     WHERE (?1 IS NULL OR entity_type = ?1)
                       AND (?2 IS NULL OR entity_id = ?2)
                       AND (?3 IS NULL OR event_type = ?3)
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?4",
                )?;
                let rows = stmt.query_map(
                    params![
                        filter.entity_type,
                        filter.entity_id,
                        filter.event_type.map(|t| t.as_str()),
                        limit as i64,
                    ],
                    RawAuditRow::from_row,
                )?;

                let mut entries = Vec::new();
                for row in rows {
                    entries.push(row?.into_entry()?);
                }
                Ok(entries)
            })
            .await
    }
}
