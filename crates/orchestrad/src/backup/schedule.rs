//! Backup schedule CRUD
//!
//! Schedules are stored definitions only; nothing in the kernel fires them.

use crate::db::KernelDb;
use crate::registry::wrap_internal;
use chrono::{DateTime, Utc};
use orchestra_common::*;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;
use uuid::Uuid;

const SCHEDULE_COLUMNS: &str = "id, name, cron_expression, enabled, backup_type, retention_days, \
     last_run, next_run, created_by, created_at, updated_at";

/// (name, min, max) for minute, hour, day-of-month, month, day-of-week
const CRON_FIELDS: [(&str, u32, u32); 5] = [
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("day-of-month", 1, 31),
    ("month", 1, 12),
    ("day-of-week", 0, 7),
];

fn parse_bounded(raw: &str, field: &str, min: u32, max: u32) -> KernelResult<u32> {
    let value: u32 = raw.parse().map_err(|_| {
        KernelError::validation(format!("cron {} field: '{}' is not a number", field, raw))
    })?;
    if value < min || value > max {
        return Err(KernelError::validation(format!(
            "cron {} field: {} is outside {}-{}",
            field, value, min, max
        )));
    }
    Ok(value)
}

fn validate_cron_item(item: &str, field: &str, min: u32, max: u32) -> KernelResult<()> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };

    if let Some(step) = step {
        let step: u32 = step.parse().map_err(|_| {
            KernelError::validation(format!("cron {} field: bad step in '{}'", field, item))
        })?;
        if step == 0 {
            return Err(KernelError::validation(format!(
                "cron {} field: step must be positive",
                field
            )));
        }
    }

    if base == "*" {
        return Ok(());
    }

    match base.split_once('-') {
        Some((lo, hi)) => {
            let lo = parse_bounded(lo, field, min, max)?;
            let hi = parse_bounded(hi, field, min, max)?;
            if lo > hi {
                return Err(KernelError::validation(format!(
                    "cron {} field: range '{}' is reversed",
                    field, base
                )));
            }
            Ok(())
        }
        None if step.is_some() => Err(KernelError::validation(format!(
            "cron {} field: step needs '*' or a range, got '{}'",
            field, item
        ))),
        None => parse_bounded(base, field, min, max).map(|_| ()),
    }
}

/// Five whitespace-separated fields: minute hour day-of-month month day-of-week
pub fn validate_cron_expression(expr: &str) -> KernelResult<()> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != CRON_FIELDS.len() {
        return Err(KernelError::validation(format!(
            "cronExpression must have 5 fields, got {}",
            fields.len()
        )));
    }
    for (raw, (name, min, max)) in fields.iter().zip(CRON_FIELDS) {
        for item in raw.split(',') {
            if item.is_empty() {
                return Err(KernelError::validation(format!(
                    "cron {} field: empty list item",
                    name
                )));
            }
            validate_cron_item(item, name, min, max)?;
        }
    }
    Ok(())
}

fn validate_retention(days: u32) -> KernelResult<()> {
    if !(1..=MAX_RETENTION_DAYS).contains(&days) {
        return Err(KernelError::validation(format!(
            "retentionDays must be between 1 and {}",
            MAX_RETENTION_DAYS
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> KernelResult<()> {
    if name.trim().is_empty() {
        return Err(KernelError::validation("name must not be empty"));
    }
    Ok(())
}

struct RawScheduleRow {
    id: String,
    name: String,
    cron_expression: String,
    enabled: bool,
    backup_type: String,
    retention_days: i64,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RawScheduleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            cron_expression: row.get(2)?,
            enabled: row.get(3)?,
            backup_type: row.get(4)?,
            retention_days: row.get(5)?,
            last_run: row.get(6)?,
            next_run: row.get(7)?,
            created_by: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_schedule(self) -> KernelResult<BackupSchedule> {
        let backup_type = self
            .backup_type
            .parse::<BackupType>()
            .map_err(|e| KernelError::internal("Corrupt backup schedule row", e))?;
        Ok(BackupSchedule {
            id: self.id,
            name: self.name,
            cron_expression: self.cron_expression,
            enabled: self.enabled,
            backup_type,
            retention_days: self.retention_days.clamp(0, u32::MAX as i64) as u32,
            last_run: self.last_run,
            next_run: self.next_run,
            created_by: self.created_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn load_schedule(conn: &Connection, id: &str) -> KernelResult<Option<BackupSchedule>> {
    let sql = format!("SELECT {} FROM backup_schedules WHERE id = ?1", SCHEDULE_COLUMNS);
    let raw = conn
        .query_row(&sql, params![id], RawScheduleRow::from_row)
        .optional()?;
    raw.map(RawScheduleRow::into_schedule).transpose()
}

pub(crate) fn load_all_schedules(conn: &Connection) -> KernelResult<Vec<BackupSchedule>> {
    let sql = format!(
        "SELECT {} FROM backup_schedules ORDER BY created_at, id",
        SCHEDULE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], RawScheduleRow::from_row)?;
    let mut schedules = Vec::new();
    for row in rows {
        schedules.push(row?.into_schedule()?);
    }
    Ok(schedules)
}

/// Insert or replace a whole schedule row
pub(crate) fn write_schedule(conn: &Connection, schedule: &BackupSchedule) -> KernelResult<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO backup_schedules ({}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            SCHEDULE_COLUMNS
        ),
        params![
            schedule.id,
            schedule.name,
            schedule.cron_expression,
            schedule.enabled,
            schedule.backup_type.as_str(),
            schedule.retention_days as i64,
            schedule.last_run,
            schedule.next_run,
            schedule.created_by,
            schedule.created_at,
            schedule.updated_at,
        ],
    )?;
    Ok(())
}

fn not_found(id: &str) -> KernelError {
    KernelError::not_found(format!("Backup schedule not found: {}", id))
}

#[derive(Clone)]
pub struct ScheduleStore {
    db: KernelDb,
}

impl ScheduleStore {
    pub fn new(db: KernelDb) -> Self {
        Self { db }
    }

    pub async fn create_schedule(
        &self,
        input: CreateScheduleInput,
        actor: &Actor,
    ) -> KernelResult<BackupSchedule> {
        validate_name(&input.name)?;
        validate_cron_expression(&input.cron_expression)?;
        validate_retention(input.retention_days)?;

        let now = Utc::now();
        let schedule = BackupSchedule {
            id: Uuid::new_v4().to_string(),
            name: input.name.trim().to_string(),
            cron_expression: input.cron_expression.trim().to_string(),
            enabled: input.enabled,
            backup_type: input.backup_type,
            retention_days: input.retention_days,
            last_run: None,
            next_run: None,
            created_by: actor.id.clone(),
            created_at: now,
            updated_at: now,
        };

        let stored = schedule.clone();
        self.db
            .execute(move |conn| write_schedule(conn, &stored))
            .await
            .map_err(|e| wrap_internal(e, "Failed to create backup schedule"))?;

        info!(
            "[BACKUP] Created schedule {} ({}) '{}'",
            schedule.name, schedule.id, schedule.cron_expression
        );
        Ok(schedule)
    }

    pub async fn list_schedules(&self) -> KernelResult<Vec<BackupSchedule>> {
        self.db
            .execute(load_all_schedules)
            .await
            .map_err(|e| wrap_internal(e, "Failed to list backup schedules"))
    }

    pub async fn get_schedule(&self, id: &str) -> KernelResult<BackupSchedule> {
        let key = id.to_string();
        self.db
            .execute(move |conn| load_schedule(conn, &key))
            .await
            .map_err(|e| wrap_internal(e, "Failed to load backup schedule"))?
            .ok_or_else(|| not_found(id))
    }

    pub async fn update_schedule(
        &self,
        id: &str,
        patch: UpdateScheduleInput,
    ) -> KernelResult<BackupSchedule> {
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        if let Some(cron) = &patch.cron_expression {
            validate_cron_expression(cron)?;
        }
        if let Some(days) = patch.retention_days {
            validate_retention(days)?;
        }

        let key = id.to_string();
        let updated = self
            .db
            .transaction(move |tx| {
                let mut schedule = load_schedule(tx, &key)?.ok_or_else(|| not_found(&key))?;
                if let Some(name) = patch.name {
                    schedule.name = name.trim().to_string();
                }
                if let Some(cron) = patch.cron_expression {
                    schedule.cron_expression = cron.trim().to_string();
                }
                if let Some(enabled) = patch.enabled {
                    schedule.enabled = enabled;
                }
                if let Some(backup_type) = patch.backup_type {
                    schedule.backup_type = backup_type;
                }
                if let Some(days) = patch.retention_days {
                    schedule.retention_days = days;
                }
                if patch.last_run.is_some() {
                    schedule.last_run = patch.last_run;
                }
                if patch.next_run.is_some() {
                    schedule.next_run = patch.next_run;
                }
                schedule.updated_at = Utc::now();
                write_schedule(tx, &schedule)?;
                Ok(schedule)
            })
            .await
            .map_err(|e| wrap_internal(e, "Failed to update backup schedule"))?;

        info!("[BACKUP] Updated schedule {}", updated.id);
        Ok(updated)
    }

    pub async fn delete_schedule(&self, id: &str) -> KernelResult<BackupSchedule> {
        let key = id.to_string();
        let removed = self
            .db
            .transaction(move |tx| {
                let schedule = load_schedule(tx, &key)?.ok_or_else(|| not_found(&key))?;
                tx.execute("DELETE FROM backup_schedules WHERE id = ?1", params![key])?;
                Ok(schedule)
            })
            .await
            .map_err(|e| wrap_internal(e, "Failed to delete backup schedule"))?;

        info!("[BACKUP] Deleted schedule {}", removed.id);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cron_accepts_common_forms() {
        for expr in [
            "0 3 * * *",
            "*/15 * * * *",
            "0 0-6/2 * * 1-5",
            "30 2 1,15 * 0",
            "0 0 * 12 7",
            "  5   4  *  *  *  ",
        ] {
            assert!(validate_cron_expression(expr).is_ok(), "{}", expr);
        }
    }

    #[test]
    fn test_cron_rejects_malformed() {
        for expr in [
            "",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5/2 * * * *",
            "6-2 * * * *",
            "1,,2 * * * *",
            "a * * * *",
        ] {
            let err = validate_cron_expression(expr).unwrap_err();
            assert_eq!(err.code(), ErrorCode::Validation, "{}", expr);
        }
    }

    #[tokio::test]
    async fn test_schedule_crud() {
        let db = KernelDb::open_in_memory().await.unwrap();
        let store = ScheduleStore::new(db);
        let created = store
            .create_schedule(CreateScheduleInput::new("nightly", "0 3 * * *"), &Actor::user("ops"))
            .await
            .unwrap();
        assert_eq!(created.created_by, "ops");
        assert_eq!(created.retention_days, DEFAULT_RETENTION_DAYS);

        let updated = store
            .update_schedule(
                &created.id,
                UpdateScheduleInput {
                    enabled: Some(false),
                    backup_type: Some(BackupType::Incremental),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.backup_type, BackupType::Incremental);
        assert_eq!(updated.name, "nightly");

        assert_eq!(store.list_schedules().await.unwrap().len(), 1);
        assert_eq!(store.get_schedule(&created.id).await.unwrap(), updated);

        store.delete_schedule(&created.id).await.unwrap();
        let err = store.get_schedule(&created.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_schedule_input_validation() {
        let db = KernelDb::open_in_memory().await.unwrap();
        let store = ScheduleStore::new(db);

        let mut input = CreateScheduleInput::new("weekly", "0 4 * * 0");
        input.retention_days = 0;
        assert!(store.create_schedule(input, &Actor::system()).await.is_err());

        let mut input = CreateScheduleInput::new("weekly", "0 4 * * 0");
        input.retention_days = MAX_RETENTION_DAYS + 1;
        assert!(store.create_schedule(input, &Actor::system()).await.is_err());

        let input = CreateScheduleInput::new("  ", "0 4 * * 0");
        assert!(store.create_schedule(input, &Actor::system()).await.is_err());

        let err = store
            .update_schedule("missing", UpdateScheduleInput::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }
}
