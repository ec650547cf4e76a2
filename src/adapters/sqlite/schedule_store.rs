//! SQLite implementation of the schedule store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::Schedule;
use crate::domain::ports::ScheduleStore;

#[derive(Clone)]
pub struct SqliteScheduleStore {
    pool: SqlitePool,
}

impl SqliteScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn insert_schedule(&self, schedule: &Schedule) -> CoreResult<()> {
        sqlx::query(
            r"INSERT INTO schedules
               (id, session_id, name, cron_expr, payload, enabled, next_run_at, last_run_at,
                created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(schedule.id.to_string())
        .bind(&schedule.session_id)
        .bind(&schedule.name)
        .bind(&schedule.cron_expr)
        .bind(&schedule.payload)
        .bind(i64::from(schedule.enabled))
        .bind(schedule.next_run_at.map(|t| t.to_rfc3339()))
        .bind(schedule.last_run_at.map(|t| t.to_rfc3339()))
        .bind(schedule.created_at.to_rfc3339())
        .bind(schedule.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> CoreResult<Vec<Schedule>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            "SELECT * FROM schedules
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?
             ORDER BY next_run_at",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Schedule::try_from).collect()
    }

    async fn update_schedule_run(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE schedules SET last_run_at = ?, next_run_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(last_run_at.to_rfc3339())
        .bind(next_run_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::ScheduleNotFound(id));
        }
        Ok(())
    }

    async fn list_schedules(&self) -> CoreResult<Vec<Schedule>> {
        let rows: Vec<ScheduleRow> =
            sqlx::query_as("SELECT * FROM schedules ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Schedule::try_from).collect()
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    session_id: String,
    name: String,
    cron_expr: String,
    payload: String,
    enabled: i64,
    next_run_at: Option<String>,
    last_run_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<ScheduleRow> for Schedule {
    type Error = CoreError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        Ok(Schedule {
            id: super::parse_uuid(&row.id)?,
            session_id: row.session_id,
            name: row.name,
            cron_expr: row.cron_expr,
            payload: row.payload,
            enabled: row.enabled != 0,
            next_run_at: super::parse_optional_datetime(row.next_run_at)?,
            last_run_at: super::parse_optional_datetime(row.last_run_at)?,
            created_at: super::parse_datetime(&row.created_at)?,
            updated_at: super::parse_datetime(&row.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn setup() -> SqliteScheduleStore {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteScheduleStore::new(pool)
    }

    #[tokio::test]
    async fn test_insert_and_list() {
        let store = setup().await;
        let schedule =
            Schedule::new("session-1", "nightly", "0 3 * * *", r#"{"content":"report"}"#).unwrap();
        store.insert_schedule(&schedule).await.unwrap();

        let all = store.list_schedules().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "nightly");
        assert!(all[0].enabled);
    }

    #[tokio::test]
    async fn test_due_and_update_run() {
        let store = setup().await;
        let mut schedule = Schedule::new("session-1", "tick", "* * * * *", "{}").unwrap();
        let now = Utc::now();
        schedule.next_run_at = Some(now - chrono::Duration::seconds(10));
        store.insert_schedule(&schedule).await.unwrap();

        let due = store.due_schedules(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, schedule.id);

        let next = now + chrono::Duration::seconds(60);
        store.update_schedule_run(schedule.id, now, next).await.unwrap();

        // No longer due after the run is recorded.
        assert!(store.due_schedules(now).await.unwrap().is_empty());
        let all = store.list_schedules().await.unwrap();
        assert_eq!(all[0].last_run_at.map(|t| t.timestamp()), Some(now.timestamp()));
    }

    #[tokio::test]
    async fn test_disabled_never_due() {
        let store = setup().await;
        let mut schedule = Schedule::new("session-1", "off", "* * * * *", "{}").unwrap();
        schedule.enabled = false;
        schedule.next_run_at = Some(Utc::now() - chrono::Duration::seconds(10));
        store.insert_schedule(&schedule).await.unwrap();

        assert!(store.due_schedules(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_schedule() {
        let store = setup().await;
        let err = store
            .update_schedule_run(Uuid::new_v4(), Utc::now(), Utc::now())
            .await;
        assert!(matches!(err, Err(CoreError::ScheduleNotFound(_))));
    }
}
