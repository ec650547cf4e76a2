//! Plan executor: runs a validated DAG plan as a sequence of waves.
//!
//! Each wave fans out its steps as engine tasks in parallel and
//! rendezvouses through the waiter before the next wave starts. Wave
//! progress and step outcomes are persisted so a crashed execution can be
//! resumed; terminal step records are never re-executed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{
    plan::{render_prompt, retry_prompt},
    ExecutionStatus, Plan, PlanExecution, PlanResult, PlanStep, StepRecord, StepStatus,
};
use crate::domain::ports::PlanStore;
use crate::services::completion_waiter::{CompletionWaiter, TaskOutcome};
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::task_engine::TaskEngine;

/// Plan executor tuning knobs.
#[derive(Debug, Clone)]
pub struct PlanExecutorConfig {
    /// Wait budget per step; a wave's budget is this times its step count.
    pub step_timeout: Duration,
    /// How long an approval-gated step waits for a response before it is
    /// treated as denied.
    pub approval_timeout: Duration,
}

impl Default for PlanExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(300),
            approval_timeout: Duration::from_secs(120),
        }
    }
}

pub struct PlanExecutor {
    plans: Arc<dyn PlanStore>,
    engine: Arc<TaskEngine>,
    waiter: Arc<CompletionWaiter>,
    bus: Arc<EventBus>,
    config: PlanExecutorConfig,
}

impl PlanExecutor {
    pub fn new(
        plans: Arc<dyn PlanStore>,
        engine: Arc<TaskEngine>,
        waiter: Arc<CompletionWaiter>,
        bus: Arc<EventBus>,
        config: PlanExecutorConfig,
    ) -> Self {
        Self {
            plans,
            engine,
            waiter,
            bus,
            config,
        }
    }

    /// Validate and execute a plan from its first wave.
    #[instrument(skip(self, plan), fields(plan = %plan.name), err)]
    pub async fn execute(&self, plan: &Plan, session_id: &str) -> CoreResult<PlanResult> {
        plan.validate()?;
        let waves = plan.waves()?;

        let execution_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let execution = PlanExecution {
            id: execution_id.clone(),
            plan_name: plan.name.clone(),
            session_id: session_id.to_string(),
            status: ExecutionStatus::Running,
            current_wave: 0,
            total_steps: plan.steps.len() as u32,
            total_cost: 0.0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.plans.create_execution(&execution).await?;

        let mut records = Vec::new();
        let mut step_index = 0u32;
        for (wave_number, wave) in waves.iter().enumerate() {
            for step in wave {
                records.push(StepRecord::pending(
                    &execution_id,
                    step,
                    step_index,
                    wave_number as u32,
                ));
                step_index += 1;
            }
        }
        self.plans.initialize_steps(&execution_id, &records).await?;

        self.bus
            .publish(EventPayload::PlanExecutionStarted {
                execution_id: execution_id.clone(),
                plan_name: plan.name.clone(),
                total_steps: plan.steps.len() as u32,
            })
            .await;

        let mut result = PlanResult {
            execution_id: execution_id.clone(),
            ..PlanResult::default()
        };
        self.run_from_wave(plan, &execution_id, session_id, 0, &mut result)
            .await?;
        Ok(result)
    }

    /// Resume a persisted execution. Terminal step records are never
    /// re-executed; resuming a finished execution is a no-op returning
    /// the stored result.
    #[instrument(skip(self, plan), err)]
    pub async fn resume(&self, execution_id: &str, plan: &Plan) -> CoreResult<PlanResult> {
        plan.validate()?;
        let execution = self
            .plans
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| CoreError::ExecutionNotFound(execution_id.to_string()))?;

        let mut result = self.hydrate_result(&execution).await?;
        if execution.status != ExecutionStatus::Running {
            // Already settled; nothing to re-run.
            return Ok(result);
        }

        info!(
            execution_id,
            current_wave = execution.current_wave,
            "resuming plan execution"
        );
        self.run_from_wave(
            plan,
            execution_id,
            &execution.session_id,
            execution.current_wave,
            &mut result,
        )
        .await?;
        Ok(result)
    }

    async fn hydrate_result(&self, execution: &PlanExecution) -> CoreResult<PlanResult> {
        let mut result = PlanResult {
            execution_id: execution.id.clone(),
            total_cost: execution.total_cost,
            ..PlanResult::default()
        };
        if execution.status != ExecutionStatus::Running {
            result.status = Some(execution.status);
        }
        for record in self.plans.get_steps(&execution.id).await? {
            result.steps.insert(record.step_id.clone(), record);
        }
        Ok(result)
    }

    async fn run_from_wave(
        &self,
        plan: &Plan,
        execution_id: &str,
        session_id: &str,
        start_wave: u32,
        result: &mut PlanResult,
    ) -> CoreResult<()> {
        let waves = plan.waves()?;

        for (wave_number, wave) in waves.iter().enumerate().skip(start_wave as usize) {
            let fatal = self
                .run_wave(execution_id, session_id, wave, result)
                .await?;

            self.plans
                .update_wave(execution_id, wave_number as u32 + 1)
                .await?;

            if let Some(error) = fatal {
                return self
                    .finish(execution_id, ExecutionStatus::Failed, result, Some(error))
                    .await;
            }
        }

        self.finish(execution_id, ExecutionStatus::Succeeded, result, None)
            .await
    }

    /// Run one wave. Returns the first fatal error message when a step
    /// failed after exhausting its retries.
    async fn run_wave(
        &self,
        execution_id: &str,
        session_id: &str,
        wave: &[&PlanStep],
        result: &mut PlanResult,
    ) -> CoreResult<Option<String>> {
        // Resume filter: persisted terminal steps are done for good.
        let persisted: BTreeMap<String, StepRecord> = self
            .plans
            .get_steps(execution_id)
            .await?
            .into_iter()
            .map(|r| (r.step_id.clone(), r))
            .collect();

        let outputs = finished_outputs(result);
        let mut launched: Vec<(&PlanStep, Uuid)> = Vec::new();
        let mut fatal: Option<String> = None;

        for &step in wave {
            if persisted
                .get(&step.id)
                .is_some_and(|r| r.status.is_terminal())
            {
                continue;
            }

            if step.requires_approval && !self.await_approval(execution_id, step).await? {
                let error = "approval denied or timed out".to_string();
                self.plans
                    .record_step_complete(
                        execution_id,
                        &step.id,
                        StepStatus::Failed,
                        None,
                        Some(&error),
                        0.0,
                    )
                    .await?;
                self.publish_step_failed(execution_id, step, None, &error).await;
                self.refresh_step(execution_id, &step.id, result).await?;
                fatal.get_or_insert(format!("step '{}': {error}", step.id));
                continue;
            }

            let prompt = render_prompt(&step.prompt, &outputs);
            let task_id = self
                .launch_step(execution_id, session_id, step, &prompt)
                .await?;
            launched.push((step, task_id));
        }

        let wave_budget = self.config.step_timeout * launched.len().max(1) as u32;
        let task_ids: Vec<Uuid> = launched.iter().map(|(_, id)| *id).collect();
        let report = self.waiter.wait_for_all(&task_ids, wave_budget).await;

        for (step, task_id) in launched {
            let settled = match report.outcomes.get(&task_id) {
                Some(outcome) => self
                    .settle_step(execution_id, session_id, step, task_id, outcome, &outputs)
                    .await?,
                None => {
                    let error = report
                        .failures
                        .get(&task_id)
                        .map_or_else(|| "wait failed".to_string(), ToString::to_string);
                    self.plans
                        .record_step_complete(
                            execution_id,
                            &step.id,
                            StepStatus::Failed,
                            None,
                            Some(&error),
                            0.0,
                        )
                        .await?;
                    self.publish_step_failed(execution_id, step, Some(task_id), &error)
                        .await;
                    StepStatus::Failed
                }
            };

            self.refresh_step(execution_id, &step.id, result).await?;
            if settled == StepStatus::Failed && fatal.is_none() {
                let error = result
                    .steps
                    .get(&step.id)
                    .and_then(|r| r.error.clone())
                    .unwrap_or_else(|| "step failed".to_string());
                fatal = Some(format!("step '{}': {error}", step.id));
            }
        }

        Ok(fatal)
    }

    /// Write a step outcome, retrying failed steps with a composed retry
    /// prompt while the persisted attempt count allows.
    async fn settle_step(
        &self,
        execution_id: &str,
        session_id: &str,
        step: &PlanStep,
        task_id: Uuid,
        outcome: &TaskOutcome,
        outputs: &BTreeMap<String, String>,
    ) -> CoreResult<StepStatus> {
        let mut task_id = task_id;
        let mut outcome = outcome.clone();

        loop {
            if outcome.succeeded() {
                self.plans
                    .record_step_complete(
                        execution_id,
                        &step.id,
                        StepStatus::Succeeded,
                        outcome.result.as_deref(),
                        None,
                        0.0,
                    )
                    .await?;
                self.bus
                    .publish(EventPayload::PlanStepCompleted {
                        execution_id: execution_id.to_string(),
                        step_id: step.id.clone(),
                        task_id,
                        agent_id: step.agent_id.clone(),
                    })
                    .await;
                return Ok(StepStatus::Succeeded);
            }

            let error = outcome
                .error
                .clone()
                .unwrap_or_else(|| format!("task ended as {}", outcome.status));
            self.plans
                .record_step_complete(
                    execution_id,
                    &step.id,
                    StepStatus::Failed,
                    None,
                    Some(&error),
                    0.0,
                )
                .await?;
            self.publish_step_failed(execution_id, step, Some(task_id), &error)
                .await;

            // The persisted record, not an in-memory counter, decides
            // whether a retry is still allowed.
            let attempt = self
                .plans
                .get_steps(execution_id)
                .await?
                .into_iter()
                .find(|r| r.step_id == step.id)
                .map_or(0, |r| r.attempt);
            if attempt >= step.max_retries {
                return Ok(StepStatus::Failed);
            }

            let base = render_prompt(&step.prompt, outputs);
            let prompt = retry_prompt(&base, attempt, &error);
            task_id = self
                .launch_step(execution_id, session_id, step, &prompt)
                .await?;

            outcome = match self
                .waiter
                .wait_for_task(task_id, self.config.step_timeout)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(step = %step.id, error = %e, "retry wait failed");
                    let error = e.to_string();
                    self.plans
                        .record_step_complete(
                            execution_id,
                            &step.id,
                            StepStatus::Failed,
                            None,
                            Some(&error),
                            0.0,
                        )
                        .await?;
                    self.publish_step_failed(execution_id, step, Some(task_id), &error)
                        .await;
                    return Ok(StepStatus::Failed);
                }
            };
        }
    }

    async fn launch_step(
        &self,
        execution_id: &str,
        session_id: &str,
        step: &PlanStep,
        prompt: &str,
    ) -> CoreResult<Uuid> {
        let task_id = self
            .engine
            .create_chat_task_for_agent(&step.agent_id, session_id, prompt)
            .await?;
        self.plans
            .mark_step_running(execution_id, &step.id, task_id, prompt)
            .await?;
        self.bus
            .publish(EventPayload::PlanStepStarted {
                execution_id: execution_id.to_string(),
                step_id: step.id.clone(),
                task_id,
                agent_id: step.agent_id.clone(),
            })
            .await;
        Ok(task_id)
    }

    /// Publish an approval request and wait (bounded) for the matching
    /// response. No response counts as denial.
    async fn await_approval(&self, execution_id: &str, step: &PlanStep) -> CoreResult<bool> {
        let request_id = Uuid::new_v4();
        let mut sub = self.bus.subscribe("hitl.approval.response").await;

        self.bus
            .publish(EventPayload::ApprovalRequested {
                request_id,
                execution_id: Some(execution_id.to_string()),
                step_id: Some(step.id.clone()),
                prompt: Some(step.prompt.clone()),
                action: "approve".to_string(),
            })
            .await;

        let deadline = sleep(self.config.approval_timeout);
        tokio::pin!(deadline);
        let approved = loop {
            tokio::select! {
                event = sub.recv() => match event {
                    Some(e) => {
                        if let EventPayload::ApprovalResponse { request_id: rid, action, .. } = e.payload {
                            if rid == request_id {
                                break action == "approve";
                            }
                        }
                    }
                    None => break false,
                },
                () = &mut deadline => {
                    warn!(step = %step.id, "approval request timed out");
                    break false;
                }
            }
        };

        self.bus.unsubscribe(sub).await;
        Ok(approved)
    }

    async fn refresh_step(
        &self,
        execution_id: &str,
        step_id: &str,
        result: &mut PlanResult,
    ) -> CoreResult<()> {
        if let Some(record) = self
            .plans
            .get_steps(execution_id)
            .await?
            .into_iter()
            .find(|r| r.step_id == step_id)
        {
            result.steps.insert(step_id.to_string(), record);
        }
        Ok(())
    }

    async fn publish_step_failed(
        &self,
        execution_id: &str,
        step: &PlanStep,
        task_id: Option<Uuid>,
        error: &str,
    ) {
        self.bus
            .publish(EventPayload::PlanStepFailed {
                execution_id: execution_id.to_string(),
                step_id: step.id.clone(),
                task_id,
                agent_id: step.agent_id.clone(),
                error: error.to_string(),
            })
            .await;
    }

    async fn finish(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        result: &mut PlanResult,
        error: Option<String>,
    ) -> CoreResult<()> {
        let total_cost: f64 = result.steps.values().map(|r| r.cost).sum();
        self.plans
            .complete_execution(execution_id, status, total_cost)
            .await?;
        self.bus
            .publish(EventPayload::PlanExecutionCompleted {
                execution_id: execution_id.to_string(),
                status: status.as_str().to_string(),
            })
            .await;

        result.status = Some(status);
        result.total_cost = total_cost;
        result.error = error;
        Ok(())
    }
}

/// Outputs of every finished step, for placeholder substitution.
fn finished_outputs(result: &PlanResult) -> BTreeMap<String, String> {
    result
        .steps
        .iter()
        .filter(|(_, r)| r.status == StepStatus::Succeeded)
        .filter_map(|(id, r)| r.result.clone().map(|out| (id.clone(), out)))
        .collect()
}
