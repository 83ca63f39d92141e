//! Append-only health history and uptime math

use crate::db::KernelDb;
use crate::registry::wrap_internal;
use chrono::{DateTime, Duration, Utc};
use orchestra_common::{
    HealthHistoryEntry, HealthHistoryPage, HealthStatus, KernelError, KernelResult, UptimeReport,
};
use rusqlite::{params, Connection, Row};

pub const DEFAULT_HISTORY_HOURS: u32 = 24;
pub const MAX_HISTORY_HOURS: u32 = 24 * 365;
pub const DEFAULT_HISTORY_LIMIT: u32 = 100;
pub const MAX_HISTORY_LIMIT: u32 = 1000;

/// Append one check result
pub(crate) fn insert_history(
    conn: &Connection,
    service_id: &str,
    status: HealthStatus,
    latency_ms: Option<u64>,
    error_message: Option<&str>,
    recorded_at: DateTime<Utc>,
) -> KernelResult<i64> {
    conn.execute(
        "INSERT INTO health_history (service_id, status, latency_ms, error_message, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            service_id,
            status.as_str(),
            latency_ms.map(|v| v as i64),
            error_message,
            recorded_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, Option<i64>, Option<String>, DateTime<Utc>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn validate_hours(hours: u32) -> KernelResult<()> {
    if hours == 0 || hours > MAX_HISTORY_HOURS {
        return Err(KernelError::validation(format!(
            "hours must be between 1 and {}",
            MAX_HISTORY_HOURS
        )));
    }
    Ok(())
}

/// `100 * healthy / total`, rounded to two decimals; 0 for an empty window
pub fn uptime_percent(healthy: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = 100.0 * healthy as f64 / total as f64;
    (raw * 100.0).round() / 100.0
}

#[derive(Clone)]
pub struct HealthHistory {
    db: KernelDb,
}

impl HealthHistory {
    pub fn new(db: KernelDb) -> Self {
        Self { db }
    }

    /// Newest first within the trailing window. `total` ignores the limit.
    pub async fn get_health_history(
        &self,
        service_id: Option<String>,
        hours: Option<u32>,
        limit: Option<u32>,
    ) -> KernelResult<HealthHistoryPage> {
        let hours = hours.unwrap_or(DEFAULT_HISTORY_HOURS);
        validate_hours(hours)?;
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
        let since = Utc::now() - Duration::hours(hours as i64);

        self.db
            .execute(move |conn| {
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM health_history
                     WHERE recorded_at >= ?1 AND (?2 IS NULL OR service_id = ?2)",
                    params![since, service_id],
                    |row| row.get(0),
                )?;

                let mut stmt = conn.prepare(
                    "SELECT id, service_id, status, latency_ms, error_message, recorded_at
                     FROM health_history
                     WHERE recorded_at >= ?1 AND (?2 IS NULL OR service_id = ?2)
                     ORDER BY recorded_at DESC, id DESC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![since, service_id, limit as i64], entry_from_row)?;

                let mut entries = Vec::new();
                for row in rows {
                    let (id, service_id, status, latency_ms, error_message, recorded_at) = row?;
                    let status = status
                        .parse::<HealthStatus>()
                        .map_err(|e| KernelError::internal("Corrupt health history row", e))?;
                    entries.push(HealthHistoryEntry {
                        id,
                        service_id,
                        status,
                        latency_ms: latency_ms.map(|v| v.max(0) as u64),
                        error_message,
                        recorded_at,
                    });
                }

                Ok(HealthHistoryPage {
                    entries,
                    total: total.max(0) as u64,
                    hours,
                })
            })
            .await
            .map_err(|e| wrap_internal(e, "Failed to read health history"))
    }

    pub async fn calculate_uptime(
        &self,
        service_id: &str,
        hours: Option<u32>,
    ) -> KernelResult<UptimeReport> {
        let hours = hours.unwrap_or(DEFAULT_HISTORY_HOURS);
        validate_hours(hours)?;
        let since = Utc::now() - Duration::hours(hours as i64);
        let id = service_id.to_string();

        let (total, healthy) = self
            .db
            .execute(move |conn| {
                let counts: (i64, i64) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'healthy' THEN 1 ELSE 0 END), 0)
                     FROM health_history
                     WHERE service_id = ?1 AND recorded_at >= ?2",
                    params![id, since],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(counts)
            })
            .await
            .map_err(|e| wrap_internal(e, "Failed to calculate uptime"))?;

        let total = total.max(0) as u64;
        let healthy = healthy.max(0) as u64;
        Ok(UptimeReport {
            service_id: service_id.to_string(),
            hours,
            uptime_percent: uptime_percent(healthy, total),
            total_checks: total,
            healthy_checks: healthy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(db: &KernelDb, rows: Vec<(&'static str, HealthStatus, DateTime<Utc>)>) {
        db.execute(move |conn| {
            for (service, status, at) in rows {
                insert_history(conn, service, status, Some(10), None, at)?;
            }
            Ok(())
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_uptime_percent_rounding() {
        assert_eq!(uptime_percent(0, 0), 0.0);
        assert_eq!(uptime_percent(3, 3), 100.0);
        assert_eq!(uptime_percent(2, 3), 66.67);
        assert_eq!(uptime_percent(1, 3), 33.33);
    }

    #[tokio::test]
    async fn test_uptime_is_zero_without_history() {
        let history = HealthHistory::new(KernelDb::open_in_memory().await.unwrap());
        let report = history.calculate_uptime("billing", None).await.unwrap();
        assert_eq!(report.uptime_percent, 0.0);
        assert_eq!(report.total_checks, 0);
        assert_eq!(report.hours, 24);
    }

    #[tokio::test]
    async fn test_uptime_counts_only_window() {
        let db = KernelDb::open_in_memory().await.unwrap();
        let now = Utc::now();
        seed(
            &db,
            vec![
                ("billing", HealthStatus::Healthy, now - Duration::minutes(5)),
                ("billing", HealthStatus::Healthy, now - Duration::minutes(10)),
                ("billing", HealthStatus::Down, now - Duration::hours(30)),
                ("crm", HealthStatus::Down, now - Duration::minutes(1)),
            ],
        )
        .await;

        let history = HealthHistory::new(db);
        let report = history.calculate_uptime("billing", Some(24)).await.unwrap();
        assert_eq!(report.total_checks, 2);
        assert_eq!(report.uptime_percent, 100.0);

        let wide = history.calculate_uptime("billing", Some(48)).await.unwrap();
        assert_eq!(wide.total_checks, 3);
        assert_eq!(wide.uptime_percent, 66.67);
    }

    #[tokio::test]
    async fn test_history_total_ignores_limit() {
        let db = KernelDb::open_in_memory().await.unwrap();
        let now = Utc::now();
        seed(
            &db,
            (0..5)
                .map(|i| ("billing", HealthStatus::Healthy, now - Duration::minutes(i)))
                .collect(),
        )
        .await;

        let history = HealthHistory::new(db);
        let page = history
            .get_health_history(Some("billing".to_string()), None, Some(2))
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.total, 5);
        assert!(page.entries[0].recorded_at >= page.entries[1].recorded_at);

        let all = history.get_health_history(None, Some(1), None).await.unwrap();
        assert_eq!(all.total, 5);
    }

    #[tokio::test]
    async fn test_zero_hours_rejected() {
        let history = HealthHistory::new(KernelDb::open_in_memory().await.unwrap());
        let err = history.get_health_history(None, Some(0), None).await.unwrap_err();
        assert_eq!(err.code(), orchestra_common::ErrorCode::Validation);
    }
}
