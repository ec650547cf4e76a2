//! Plan execution store port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::CoreResult;
use crate::domain::models::{ExecutionStatus, PlanExecution, StepRecord, StepStatus};

/// Repository interface for persisted plan executions and step records.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Record a new execution in `running` status.
    async fn create_execution(&self, execution: &PlanExecution) -> CoreResult<()>;

    /// Insert the initial pending step records for an execution.
    async fn initialize_steps(&self, execution_id: &str, steps: &[StepRecord]) -> CoreResult<()>;

    /// Advance the execution's current wave marker.
    async fn update_wave(&self, execution_id: &str, wave_number: u32) -> CoreResult<()>;

    /// Mark a step running with its launched task, storing the rendered
    /// prompt and bumping the persisted attempt counter. Returns the new
    /// attempt number.
    async fn mark_step_running(
        &self,
        execution_id: &str,
        step_id: &str,
        task_id: Uuid,
        prompt: &str,
    ) -> CoreResult<u32>;

    /// Write a step's outcome.
    async fn record_step_complete(
        &self,
        execution_id: &str,
        step_id: &str,
        status: StepStatus,
        result: Option<&str>,
        error: Option<&str>,
        cost: f64,
    ) -> CoreResult<()>;

    async fn get_execution(&self, execution_id: &str) -> CoreResult<Option<PlanExecution>>;

    /// All step records of an execution, ordered by wave then step index.
    async fn get_steps(&self, execution_id: &str) -> CoreResult<Vec<StepRecord>>;

    /// Write the final execution status and aggregate cost.
    async fn complete_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        total_cost: f64,
    ) -> CoreResult<()>;
}
