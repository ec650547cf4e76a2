//! SQLite implementation of the task store.
//!
//! Lease discipline is enforced with conditional updates keyed on
//! `(id, lease_owner)`: a stale worker's write simply affects zero rows.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult, ErrorCode};
use crate::domain::models::{HistoryItem, Role, Task, TaskStatus};
use crate::domain::ports::TaskStore;

/// Priority aging never raises a queued task above this value.
const PRIORITY_AGING_CAP: i64 = 100;

/// Retry backoff ceiling.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
    retry_backoff_base: Duration,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry_backoff_base: Duration::from_secs(2),
        }
    }

    /// Override the base used for exponential retry backoff.
    pub fn with_retry_backoff(mut self, base: Duration) -> Self {
        self.retry_backoff_base = base;
        self
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.retry_backoff_base.saturating_mul(1u32 << exp);
        delay.min(MAX_RETRY_BACKOFF)
    }

    async fn claim_where(&self, scope_sql: &str, scope_bind: Option<&str>, lease_owner: &str, lease_ttl: Duration) -> CoreResult<Option<Task>> {
        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(lease_ttl).unwrap_or(chrono::Duration::seconds(60));

        let sql = format!(
            r"UPDATE tasks
               SET status = 'running', lease_owner = ?1, lease_expires_at = ?2, updated_at = ?3
               WHERE id = (
                   SELECT id FROM tasks
                   WHERE status = 'queued' AND {scope_sql}
                     AND (not_before IS NULL OR not_before <= ?3)
                   ORDER BY priority DESC, created_at ASC
                   LIMIT 1
               )
               RETURNING id"
        );

        let mut query = sqlx::query_as::<_, (String,)>(&sql)
            .bind(lease_owner)
            .bind(expires.to_rfc3339())
            .bind(now.to_rfc3339());
        if let Some(bind) = scope_bind {
            query = query.bind(bind);
        }

        let claimed = query.fetch_optional(&self.pool).await?;
        match claimed {
            Some((id,)) => self.get_task(super::parse_uuid(&id)?).await,
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn ensure_session(&self, session_id: &str) -> CoreResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("INSERT OR IGNORE INTO sessions (id, created_at, updated_at) VALUES (?, ?, ?)")
            .bind(session_id)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_history(
        &self,
        session_id: &str,
        agent_id: Option<&str>,
        role: Role,
        content: &str,
        tokens: u32,
    ) -> CoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO history (session_id, agent_id, role, content, tokens, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(agent_id)
        .bind(role.as_str())
        .bind(content)
        .bind(i64::from(tokens))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_history(&self, session_id: &str, limit: usize) -> CoreResult<Vec<HistoryItem>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT * FROM history
             WHERE session_id = ? AND archived = 0
             ORDER BY id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows
            .into_iter()
            .map(HistoryItem::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        items.reverse();
        Ok(items)
    }

    async fn archive_messages(&self, session_id: &str, up_to_id: i64) -> CoreResult<u64> {
        let result = sqlx::query(
            "UPDATE history SET archived = 1 WHERE session_id = ? AND id <= ? AND archived = 0",
        )
        .bind(session_id)
        .bind(up_to_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn create_task(&self, session_id: &str, payload: &str) -> CoreResult<Uuid> {
        let task = Task::new(session_id, payload);
        insert_task(&self.pool, &task).await?;
        Ok(task.id)
    }

    async fn create_task_for_agent(
        &self,
        agent_id: &str,
        session_id: &str,
        payload: &str,
    ) -> CoreResult<Uuid> {
        let task = Task::new(session_id, payload).with_agent(agent_id);
        insert_task(&self.pool, &task).await?;
        Ok(task.id)
    }

    async fn get_task(&self, id: Uuid) -> CoreResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn list_tasks_by_session(&self, session_id: &str) -> CoreResult<Vec<Task>> {
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE session_id = ? ORDER BY created_at DESC")
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn claim_next_pending_task(
        &self,
        lease_owner: &str,
        lease_ttl: Duration,
    ) -> CoreResult<Option<Task>> {
        self.claim_where("agent_id IS NULL", None, lease_owner, lease_ttl)
            .await
    }

    async fn claim_next_pending_task_for_agent(
        &self,
        agent_id: &str,
        lease_owner: &str,
        lease_ttl: Duration,
    ) -> CoreResult<Option<Task>> {
        self.claim_where("agent_id = ?4", Some(agent_id), lease_owner, lease_ttl)
            .await
    }

    async fn claim_task(
        &self,
        id: Uuid,
        lease_owner: &str,
        lease_ttl: Duration,
    ) -> CoreResult<bool> {
        let now = Utc::now();
        let expires =
            now + chrono::Duration::from_std(lease_ttl).unwrap_or(chrono::Duration::seconds(60));
        let result = sqlx::query(
            "UPDATE tasks
             SET status = 'running', lease_owner = ?, lease_expires_at = ?, updated_at = ?
             WHERE id = ? AND status = 'queued'",
        )
        .bind(lease_owner)
        .bind(expires.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn start_task_run(
        &self,
        id: Uuid,
        lease_owner: &str,
        policy_version: &str,
    ) -> CoreResult<u32> {
        let now = Utc::now().to_rfc3339();
        let attempt: Option<(i64,)> = sqlx::query_as(
            "UPDATE tasks
             SET attempt = attempt + 1, policy_version = ?, started_at = ?, updated_at = ?
             WHERE id = ? AND lease_owner = ? AND status = 'running'
             RETURNING attempt",
        )
        .bind(policy_version)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .bind(lease_owner)
        .fetch_optional(&self.pool)
        .await?;

        match attempt {
            Some((n,)) => Ok(n as u32),
            None => Err(CoreError::LeaseLost {
                task_id: id,
                lease_owner: lease_owner.to_string(),
            }),
        }
    }

    async fn heartbeat_lease(
        &self,
        id: Uuid,
        lease_owner: &str,
        lease_ttl: Duration,
    ) -> CoreResult<bool> {
        let expires = Utc::now()
            + chrono::Duration::from_std(lease_ttl).unwrap_or(chrono::Duration::seconds(60));
        let result = sqlx::query(
            "UPDATE tasks SET lease_expires_at = ?, updated_at = ?
             WHERE id = ? AND lease_owner = ? AND status = 'running'",
        )
        .bind(expires.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(lease_owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_task(&self, id: Uuid, lease_owner: &str, result: &str) -> CoreResult<()> {
        let now = Utc::now().to_rfc3339();
        let outcome = sqlx::query(
            "UPDATE tasks
             SET status = 'succeeded', result = ?, error = NULL,
                 lease_owner = NULL, lease_expires_at = NULL,
                 completed_at = ?, updated_at = ?
             WHERE id = ? AND lease_owner = ? AND status = 'running'",
        )
        .bind(result)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .bind(lease_owner)
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(CoreError::LeaseLost {
                task_id: id,
                lease_owner: lease_owner.to_string(),
            });
        }
        Ok(())
    }

    async fn handle_task_failure(
        &self,
        id: Uuid,
        lease_owner: &str,
        error: &str,
        code: ErrorCode,
        max_attempts: u32,
    ) -> CoreResult<TaskStatus> {
        let task = self
            .get_task(id)
            .await?
            .ok_or(CoreError::TaskNotFound(id))?;

        let now = Utc::now();
        let retrying = task.attempt < max_attempts;
        let not_before = retrying.then(|| {
            (now + chrono::Duration::from_std(self.backoff_for_attempt(task.attempt))
                .unwrap_or(chrono::Duration::seconds(2)))
            .to_rfc3339()
        });
        let next_status = if retrying {
            TaskStatus::Queued
        } else {
            TaskStatus::DeadLetter
        };

        let outcome = sqlx::query(
            "UPDATE tasks
             SET status = ?, error = ?, last_error_code = ?,
                 not_before = ?, lease_owner = NULL, lease_expires_at = NULL,
                 completed_at = ?, updated_at = ?
             WHERE id = ? AND lease_owner = ? AND status = 'running'",
        )
        .bind(next_status.as_str())
        .bind(error)
        .bind(code.as_str())
        .bind(&not_before)
        .bind((!retrying).then(|| now.to_rfc3339()))
        .bind(now.to_rfc3339())
        .bind(id.to_string())
        .bind(lease_owner)
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(CoreError::LeaseLost {
                task_id: id,
                lease_owner: lease_owner.to_string(),
            });
        }
        Ok(next_status)
    }

    async fn abort_task(&self, id: Uuid) -> CoreResult<bool> {
        let now = Utc::now().to_rfc3339();

        // Queued tasks cancel outright.
        let canceled = sqlx::query(
            "UPDATE tasks
             SET status = 'canceled', cancel_requested = 1, completed_at = ?, updated_at = ?
             WHERE id = ? AND status = 'queued'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if canceled.rows_affected() > 0 {
            return Ok(true);
        }

        // Running tasks get the flag; the owning worker finalizes.
        let flagged = sqlx::query(
            "UPDATE tasks SET cancel_requested = 1, updated_at = ?
             WHERE id = ? AND status = 'running' AND cancel_requested = 0",
        )
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(flagged.rows_affected() > 0)
    }

    async fn cancel_task(&self, id: Uuid, lease_owner: &str) -> CoreResult<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE tasks
             SET status = 'canceled', lease_owner = NULL, lease_expires_at = NULL,
                 completed_at = ?, updated_at = ?
             WHERE id = ? AND lease_owner = ? AND status = 'running'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .bind(lease_owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_cancel_requested(&self, id: Uuid) -> CoreResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT cancel_requested FROM tasks WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some_and(|(flag,)| flag != 0))
    }

    async fn recover_running_tasks(&self) -> CoreResult<u64> {
        let result = sqlx::query(
            "UPDATE tasks
             SET status = 'queued', lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
             WHERE status = 'running'",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn requeue_expired_leases(&self) -> CoreResult<u64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE tasks
             SET status = 'queued', lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
             WHERE status = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?",
        )
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn age_queued_priorities(
        &self,
        older_than: Duration,
        increment: i64,
    ) -> CoreResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::seconds(60));
        let result = sqlx::query(
            "UPDATE tasks SET priority = priority + ?, updated_at = ?
             WHERE status = 'queued' AND created_at <= ? AND priority < ?",
        )
        .bind(increment)
        .bind(Utc::now().to_rfc3339())
        .bind(cutoff.to_rfc3339())
        .bind(PRIORITY_AGING_CAP)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn queue_depth(&self) -> CoreResult<u64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks WHERE status = 'queued' AND agent_id IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u64)
    }

    async fn queue_depth_for_agent(&self, agent_id: &str) -> CoreResult<u64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = 'queued' AND agent_id = ?")
                .bind(agent_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0 as u64)
    }
}

async fn insert_task(pool: &SqlitePool, task: &Task) -> CoreResult<()> {
    sqlx::query(
        r"INSERT INTO tasks (id, session_id, agent_id, payload, status, attempt, priority,
           lease_owner, lease_expires_at, not_before, cancel_requested, result, error,
           last_error_code, policy_version, created_at, updated_at, started_at, completed_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task.id.to_string())
    .bind(&task.session_id)
    .bind(&task.agent_id)
    .bind(&task.payload)
    .bind(task.status.as_str())
    .bind(i64::from(task.attempt))
    .bind(task.priority)
    .bind(&task.lease_owner)
    .bind(task.lease_expires_at.map(|t| t.to_rfc3339()))
    .bind(task.not_before.map(|t| t.to_rfc3339()))
    .bind(i64::from(task.cancel_requested))
    .bind(&task.result)
    .bind(&task.error)
    .bind(task.last_error_code.map(|c| c.as_str()))
    .bind(&task.policy_version)
    .bind(task.created_at.to_rfc3339())
    .bind(task.updated_at.to_rfc3339())
    .bind(task.started_at.map(|t| t.to_rfc3339()))
    .bind(task.completed_at.map(|t| t.to_rfc3339()))
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    session_id: String,
    agent_id: Option<String>,
    payload: String,
    status: String,
    attempt: i64,
    priority: i64,
    lease_owner: Option<String>,
    lease_expires_at: Option<String>,
    not_before: Option<String>,
    cancel_requested: i64,
    result: Option<String>,
    error: Option<String>,
    last_error_code: Option<String>,
    policy_version: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::from_str(&row.status)
            .ok_or_else(|| CoreError::Serialization(format!("invalid status: {}", row.status)))?;

        Ok(Task {
            id: super::parse_uuid(&row.id)?,
            session_id: row.session_id,
            agent_id: row.agent_id,
            payload: row.payload,
            status,
            attempt: row.attempt as u32,
            priority: row.priority,
            lease_owner: row.lease_owner,
            lease_expires_at: super::parse_optional_datetime(row.lease_expires_at)?,
            not_before: super::parse_optional_datetime(row.not_before)?,
            cancel_requested: row.cancel_requested != 0,
            result: row.result,
            error: row.error,
            last_error_code: row.last_error_code.as_deref().and_then(ErrorCode::from_str),
            policy_version: row.policy_version,
            created_at: super::parse_datetime(&row.created_at)?,
            updated_at: super::parse_datetime(&row.updated_at)?,
            started_at: super::parse_optional_datetime(row.started_at)?,
            completed_at: super::parse_optional_datetime(row.completed_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    session_id: String,
    agent_id: Option<String>,
    role: String,
    content: String,
    tokens: i64,
    archived: i64,
    created_at: String,
}

impl TryFrom<HistoryRow> for HistoryItem {
    type Error = CoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let role = Role::from_str(&row.role)
            .ok_or_else(|| CoreError::Serialization(format!("invalid role: {}", row.role)))?;
        Ok(HistoryItem {
            id: row.id,
            session_id: row.session_id,
            agent_id: row.agent_id,
            role,
            content: row.content,
            tokens: row.tokens as u32,
            archived: row.archived != 0,
            created_at: super::parse_datetime(&row.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    const TTL: Duration = Duration::from_secs(60);

    async fn setup() -> SqliteTaskStore {
        let pool = create_migrated_test_pool().await.unwrap();
        let store = SqliteTaskStore::new(pool);
        store.ensure_session("session-1").await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_create_and_get_task() {
        let store = setup().await;
        let id = store
            .create_task("session-1", r#"{"content":"hi"}"#)
            .await
            .unwrap();

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.session_id, "session-1");
        assert!(task.agent_id.is_none());
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_age() {
        let store = setup().await;
        let low = store.create_task("session-1", "low").await.unwrap();
        let high = store.create_task("session-1", "high").await.unwrap();

        sqlx::query("UPDATE tasks SET priority = 5 WHERE id = ?")
            .bind(high.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        let first = store
            .claim_next_pending_task("w1", TTL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, high);
        assert_eq!(first.status, TaskStatus::Running);
        assert_eq!(first.lease_owner.as_deref(), Some("w1"));
        assert!(first.lease_expires_at.unwrap() > Utc::now());

        let second = store
            .claim_next_pending_task("w2", TTL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, low);

        assert!(store.claim_next_pending_task("w3", TTL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_agent_scope_isolation() {
        let store = setup().await;
        store
            .create_task_for_agent("coder", "session-1", "scoped")
            .await
            .unwrap();

        // The global pool never sees agent-scoped work.
        assert!(store.claim_next_pending_task("w1", TTL).await.unwrap().is_none());
        assert!(store
            .claim_next_pending_task_for_agent("other", "w1", TTL)
            .await
            .unwrap()
            .is_none());

        let claimed = store
            .claim_next_pending_task_for_agent("coder", "w1", TTL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.agent_id.as_deref(), Some("coder"));

        assert_eq!(store.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_skips_backoff_window() {
        let store = setup().await;
        let id = store.create_task("session-1", "later").await.unwrap();

        let future = (Utc::now() + chrono::Duration::seconds(60)).to_rfc3339();
        sqlx::query("UPDATE tasks SET not_before = ? WHERE id = ?")
            .bind(&future)
            .bind(id.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(store.claim_next_pending_task("w1", TTL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_run_bumps_attempt_and_pins_policy() {
        let store = setup().await;
        let id = store.create_task("session-1", "p").await.unwrap();
        store.claim_next_pending_task("w1", TTL).await.unwrap().unwrap();

        let attempt = store.start_task_run(id, "w1", "policy-v1").await.unwrap();
        assert_eq!(attempt, 1);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.policy_version.as_deref(), Some("policy-v1"));
        assert!(task.started_at.is_some());

        // A stale owner cannot start a run.
        let err = store.start_task_run(id, "w2", "policy-v1").await;
        assert!(matches!(err, Err(CoreError::LeaseLost { .. })));
    }

    #[tokio::test]
    async fn test_heartbeat_only_for_owner() {
        let store = setup().await;
        let id = store.create_task("session-1", "p").await.unwrap();
        store.claim_next_pending_task("w1", TTL).await.unwrap().unwrap();

        assert!(store.heartbeat_lease(id, "w1", TTL).await.unwrap());
        assert!(!store.heartbeat_lease(id, "intruder", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_rejects_stale_owner() {
        let store = setup().await;
        let id = store.create_task("session-1", "p").await.unwrap();
        store.claim_next_pending_task("w1", TTL).await.unwrap().unwrap();

        let err = store.complete_task(id, "stale", "nope").await;
        assert!(matches!(err, Err(CoreError::LeaseLost { .. })));

        store.complete_task(id, "w1", "done").await.unwrap();
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.result.as_deref(), Some("done"));
        assert!(task.lease_owner.is_none());
    }

    #[tokio::test]
    async fn test_failure_requeues_with_backoff_then_dead_letters() {
        let store = setup().await;
        let id = store.create_task("session-1", "p").await.unwrap();

        // Attempt 1 fails: back to queued with a backoff gate.
        store.claim_next_pending_task("w1", TTL).await.unwrap().unwrap();
        store.start_task_run(id, "w1", "v1").await.unwrap();
        let status = store
            .handle_task_failure(id, "w1", "boom", ErrorCode::Unknown, 2)
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Queued);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.attempt, 1);
        assert!(task.not_before.is_some());
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert_eq!(task.last_error_code, Some(ErrorCode::Unknown));

        // Clear the gate and fail the final attempt: dead letter.
        sqlx::query("UPDATE tasks SET not_before = NULL WHERE id = ?")
            .bind(id.to_string())
            .execute(&store.pool)
            .await
            .unwrap();
        store.claim_next_pending_task("w1", TTL).await.unwrap().unwrap();
        store.start_task_run(id, "w1", "v1").await.unwrap();
        let status = store
            .handle_task_failure(id, "w1", "rate limit hit", ErrorCode::RateLimit, 2)
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::DeadLetter);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::DeadLetter);
        assert_eq!(task.last_error_code, Some(ErrorCode::RateLimit));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_abort_queued_cancels_outright() {
        let store = setup().await;
        let id = store.create_task("session-1", "p").await.unwrap();

        assert!(store.abort_task(id).await.unwrap());
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);

        // Terminal: a second abort is a no-op.
        assert!(!store.abort_task(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_abort_running_flags_then_owner_finalizes() {
        let store = setup().await;
        let id = store.create_task("session-1", "p").await.unwrap();
        store.claim_next_pending_task("w1", TTL).await.unwrap().unwrap();

        assert!(store.abort_task(id).await.unwrap());
        assert!(store.is_cancel_requested(id).await.unwrap());
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        assert!(store.cancel_task(id, "w1").await.unwrap());
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_requeue_expired_leases() {
        let store = setup().await;
        let id = store.create_task("session-1", "p").await.unwrap();
        store.claim_next_pending_task("w1", TTL).await.unwrap().unwrap();
        store.start_task_run(id, "w1", "v1").await.unwrap();

        // Fresh lease: nothing to requeue.
        assert_eq!(store.requeue_expired_leases().await.unwrap(), 0);

        let past = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        sqlx::query("UPDATE tasks SET lease_expires_at = ? WHERE id = ?")
            .bind(&past)
            .bind(id.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        assert_eq!(store.requeue_expired_leases().await.unwrap(), 1);
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempt, 1); // unchanged
        assert!(task.lease_owner.is_none());
    }

    #[tokio::test]
    async fn test_recover_running_tasks() {
        let store = setup().await;
        let id = store.create_task("session-1", "p").await.unwrap();
        store.claim_next_pending_task("w1", TTL).await.unwrap().unwrap();

        assert_eq!(store.recover_running_tasks().await.unwrap(), 1);
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempt, 0);
    }

    #[tokio::test]
    async fn test_age_queued_priorities() {
        let store = setup().await;
        let id = store.create_task("session-1", "old").await.unwrap();

        let old = (Utc::now() - chrono::Duration::seconds(120)).to_rfc3339();
        sqlx::query("UPDATE tasks SET created_at = ? WHERE id = ?")
            .bind(&old)
            .bind(id.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        let aged = store
            .age_queued_priorities(Duration::from_secs(60), 3)
            .await
            .unwrap();
        assert_eq!(aged, 1);
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.priority, 3);
    }

    #[tokio::test]
    async fn test_history_and_archive() {
        let store = setup().await;
        let first = store
            .add_history("session-1", None, Role::User, "hello", 2)
            .await
            .unwrap();
        store
            .add_history("session-1", Some("coder"), Role::Assistant, "hi there", 3)
            .await
            .unwrap();

        let items = store.list_history("session-1", 10).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].role, Role::User);
        assert_eq!(items[1].agent_id.as_deref(), Some("coder"));

        let archived = store.archive_messages("session-1", first).await.unwrap();
        assert_eq!(archived, 1);
        let items = store.list_history("session-1", 10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].role, Role::Assistant);
    }
}
