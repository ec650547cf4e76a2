//! SQLite implementation of the loop checkpoint store.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{LoopCheckpoint, LoopStatus};
use crate::domain::ports::LoopStore;

#[derive(Clone)]
pub struct SqliteLoopStore {
    pool: SqlitePool,
}

impl SqliteLoopStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LoopStore for SqliteLoopStore {
    async fn save_loop_checkpoint(&self, checkpoint: &LoopCheckpoint) -> CoreResult<()> {
        sqlx::query(
            r"INSERT INTO loop_checkpoints
               (loop_id, task_id, agent_id, current_step, max_steps, tokens_used, max_tokens,
                started_at, max_duration_secs, status, messages, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(loop_id) DO UPDATE SET
                 current_step = excluded.current_step,
                 tokens_used = excluded.tokens_used,
                 status = excluded.status,
                 messages = excluded.messages,
                 updated_at = excluded.updated_at",
        )
        .bind(checkpoint.loop_id.to_string())
        .bind(checkpoint.task_id.to_string())
        .bind(&checkpoint.agent_id)
        .bind(i64::from(checkpoint.current_step))
        .bind(i64::from(checkpoint.max_steps))
        .bind(checkpoint.tokens_used as i64)
        .bind(checkpoint.max_tokens as i64)
        .bind(checkpoint.started_at.to_rfc3339())
        .bind(checkpoint.max_duration_secs as i64)
        .bind(checkpoint.status.as_str())
        .bind(&checkpoint.messages)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_loop_checkpoint(&self, task_id: Uuid) -> CoreResult<Option<LoopCheckpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            "SELECT * FROM loop_checkpoints
             WHERE task_id = ? AND status = 'running'
             ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(LoopCheckpoint::try_from).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    loop_id: String,
    task_id: String,
    agent_id: Option<String>,
    current_step: i64,
    max_steps: i64,
    tokens_used: i64,
    max_tokens: i64,
    started_at: String,
    max_duration_secs: i64,
    status: String,
    messages: String,
}

impl TryFrom<CheckpointRow> for LoopCheckpoint {
    type Error = CoreError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        let status = LoopStatus::from_str(&row.status).ok_or_else(|| {
            CoreError::Serialization(format!("invalid loop status: {}", row.status))
        })?;
        Ok(LoopCheckpoint {
            loop_id: super::parse_uuid(&row.loop_id)?,
            task_id: super::parse_uuid(&row.task_id)?,
            agent_id: row.agent_id,
            current_step: row.current_step as u32,
            max_steps: row.max_steps as u32,
            tokens_used: row.tokens_used as u64,
            max_tokens: row.max_tokens as u64,
            started_at: super::parse_datetime(&row.started_at)?,
            max_duration_secs: row.max_duration_secs as u64,
            status,
            messages: row.messages,
        })
    }
}
