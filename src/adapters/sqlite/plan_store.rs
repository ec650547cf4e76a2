//! SQLite implementation of the plan execution store.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{ExecutionStatus, PlanExecution, StepRecord, StepStatus};
use crate::domain::ports::PlanStore;

#[derive(Clone)]
pub struct SqlitePlanStore {
    pool: SqlitePool,
}

impl SqlitePlanStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanStore for SqlitePlanStore {
    async fn create_execution(&self, execution: &PlanExecution) -> CoreResult<()> {
        sqlx::query(
            r"INSERT INTO plan_executions
               (id, plan_name, session_id, status, current_wave, total_steps, total_cost,
                created_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&execution.id)
        .bind(&execution.plan_name)
        .bind(&execution.session_id)
        .bind(execution.status.as_str())
        .bind(i64::from(execution.current_wave))
        .bind(i64::from(execution.total_steps))
        .bind(execution.total_cost)
        .bind(execution.created_at.to_rfc3339())
        .bind(execution.updated_at.to_rfc3339())
        .bind(execution.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn initialize_steps(&self, execution_id: &str, steps: &[StepRecord]) -> CoreResult<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        for step in steps {
            sqlx::query(
                r"INSERT INTO plan_steps
                   (execution_id, step_id, step_index, wave_number, agent_id, prompt, status,
                    attempt, task_id, result, error, cost, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(execution_id)
            .bind(&step.step_id)
            .bind(i64::from(step.step_index))
            .bind(i64::from(step.wave_number))
            .bind(&step.agent_id)
            .bind(&step.prompt)
            .bind(step.status.as_str())
            .bind(i64::from(step.attempt))
            .bind(step.task_id.map(|id| id.to_string()))
            .bind(&step.result)
            .bind(&step.error)
            .bind(step.cost)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_wave(&self, execution_id: &str, wave_number: u32) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE plan_executions SET current_wave = ?, updated_at = ? WHERE id = ?",
        )
        .bind(i64::from(wave_number))
        .bind(Utc::now().to_rfc3339())
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::ExecutionNotFound(execution_id.to_string()));
        }
        Ok(())
    }

    async fn mark_step_running(
        &self,
        execution_id: &str,
        step_id: &str,
        task_id: Uuid,
        prompt: &str,
    ) -> CoreResult<u32> {
        let attempt: Option<(i64,)> = sqlx::query_as(
            r"UPDATE plan_steps
               SET status = 'running', task_id = ?, prompt = ?, attempt = attempt + 1,
                   updated_at = ?
               WHERE execution_id = ? AND step_id = ?
               RETURNING attempt",
        )
        .bind(task_id.to_string())
        .bind(prompt)
        .bind(Utc::now().to_rfc3339())
        .bind(execution_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        attempt
            .map(|(n,)| n as u32)
            .ok_or_else(|| CoreError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn record_step_complete(
        &self,
        execution_id: &str,
        step_id: &str,
        status: StepStatus,
        result: Option<&str>,
        error: Option<&str>,
        cost: f64,
    ) -> CoreResult<()> {
        let outcome = sqlx::query(
            r"UPDATE plan_steps
               SET status = ?, result = ?, error = ?, cost = cost + ?, updated_at = ?
               WHERE execution_id = ? AND step_id = ?",
        )
        .bind(status.as_str())
        .bind(result)
        .bind(error)
        .bind(cost)
        .bind(Utc::now().to_rfc3339())
        .bind(execution_id)
        .bind(step_id)
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(CoreError::ExecutionNotFound(execution_id.to_string()));
        }
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> CoreResult<Option<PlanExecution>> {
        let row: Option<ExecutionRow> =
            sqlx::query_as("SELECT * FROM plan_executions WHERE id = ?")
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(PlanExecution::try_from).transpose()
    }

    async fn get_steps(&self, execution_id: &str) -> CoreResult<Vec<StepRecord>> {
        let rows: Vec<StepRow> = sqlx::query_as(
            "SELECT * FROM plan_steps WHERE execution_id = ?
             ORDER BY wave_number, step_index",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StepRecord::try_from).collect()
    }

    async fn complete_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        total_cost: f64,
    ) -> CoreResult<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r"UPDATE plan_executions
               SET status = ?, total_cost = ?, completed_at = ?, updated_at = ?
               WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(total_cost)
        .bind(&now)
        .bind(&now)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::ExecutionNotFound(execution_id.to_string()));
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    plan_name: String,
    session_id: String,
    status: String,
    current_wave: i64,
    total_steps: i64,
    total_cost: f64,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl TryFrom<ExecutionRow> for PlanExecution {
    type Error = CoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let status = ExecutionStatus::from_str(&row.status).ok_or_else(|| {
            CoreError::Serialization(format!("invalid execution status: {}", row.status))
        })?;
        Ok(PlanExecution {
            id: row.id,
            plan_name: row.plan_name,
            session_id: row.session_id,
            status,
            current_wave: row.current_wave as u32,
            total_steps: row.total_steps as u32,
            total_cost: row.total_cost,
            created_at: super::parse_datetime(&row.created_at)?,
            updated_at: super::parse_datetime(&row.updated_at)?,
            completed_at: super::parse_optional_datetime(row.completed_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    execution_id: String,
    step_id: String,
    step_index: i64,
    wave_number: i64,
    agent_id: String,
    prompt: String,
    status: String,
    attempt: i64,
    task_id: Option<String>,
    result: Option<String>,
    error: Option<String>,
    cost: f64,
}

impl TryFrom<StepRow> for StepRecord {
    type Error = CoreError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let status = StepStatus::from_str(&row.status).ok_or_else(|| {
            CoreError::Serialization(format!("invalid step status: {}", row.status))
        })?;
        Ok(StepRecord {
            execution_id: row.execution_id,
            step_id: row.step_id,
            step_index: row.step_index as u32,
            wave_number: row.wave_number as u32,
            agent_id: row.agent_id,
            prompt: row.prompt,
            status,
            attempt: row.attempt as u32,
            task_id: super::parse_optional_uuid(row.task_id)?,
            result: row.result,
            error: row.error,
            cost: row.cost,
        })
    }
}
