//! Loop runner: iterative single-agent "continue working" loop bounded by
//! step count, token budget, and wall time.
//!
//! A checkpoint is persisted at a configurable interval so a crashed loop
//! resumes from its last saved step instead of restarting its budgets.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{ChatPayload, LoopCheckpoint, LoopStatus};
use crate::domain::ports::{Brain, LoopStore, TaskStore};
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::task_engine::approx_tokens;

/// Loop budgets and cadence.
#[derive(Debug, Clone)]
pub struct LoopRunnerConfig {
    pub max_steps: u32,
    pub max_tokens: u64,
    pub max_duration: Duration,
    /// A running checkpoint is saved every this many steps.
    pub checkpoint_interval: u32,
    /// Reply marker that ends the loop as completed.
    pub termination_keyword: String,
}

impl Default for LoopRunnerConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            max_tokens: 100_000,
            max_duration: Duration::from_secs(1800),
            checkpoint_interval: 5,
            termination_keyword: "<<LOOP_DONE>>".to_string(),
        }
    }
}

/// Final report of one loop run.
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub status: LoopStatus,
    pub steps: u32,
    pub tokens_used: u64,
    pub response: String,
    pub error: Option<String>,
}

pub struct LoopRunner {
    tasks: Arc<dyn TaskStore>,
    loops: Arc<dyn LoopStore>,
    brain: Arc<dyn Brain>,
    bus: Arc<EventBus>,
    config: LoopRunnerConfig,
}

impl LoopRunner {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        loops: Arc<dyn LoopStore>,
        brain: Arc<dyn Brain>,
        bus: Arc<EventBus>,
        config: LoopRunnerConfig,
    ) -> Self {
        Self {
            tasks,
            loops,
            brain,
            bus,
            config,
        }
    }

    /// Run the loop for a task, resuming a persisted `running` checkpoint
    /// when one exists.
    #[instrument(skip(self), err)]
    pub async fn run(&self, task_id: Uuid) -> CoreResult<LoopResult> {
        self.run_cancellable(task_id, &CancellationToken::new())
            .await
    }

    /// As [`run`](Self::run), with cooperative cancellation. A cancelled
    /// loop saves a `cancelled` checkpoint and returns.
    pub async fn run_cancellable(
        &self,
        task_id: Uuid,
        cancel: &CancellationToken,
    ) -> CoreResult<LoopResult> {
        let task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or(CoreError::TaskNotFound(task_id))?;

        let mut checkpoint = match self.loops.load_loop_checkpoint(task_id).await? {
            Some(cp) => {
                info!(loop_id = %cp.loop_id, step = cp.current_step, "resuming loop from checkpoint");
                cp
            }
            None => LoopCheckpoint::start(
                task_id,
                task.agent_id.clone(),
                self.config.max_steps,
                self.config.max_tokens,
                self.config.max_duration.as_secs(),
            ),
        };
        let deadline = checkpoint.deadline();

        let content = ChatPayload::decode(&task.payload)
            .map(|p| p.content)
            .unwrap_or_else(|_| task.payload.clone());
        let mut replies: Vec<String> =
            serde_json::from_str(&checkpoint.messages).unwrap_or_default();

        self.publish_lifecycle(&checkpoint, |loop_id, task_id, agent_id, step| {
            EventPayload::LoopStarted {
                loop_id,
                task_id,
                agent_id,
                step,
                max_steps: checkpoint.max_steps,
            }
        })
        .await;

        loop {
            if checkpoint.current_step >= checkpoint.max_steps
                || checkpoint.tokens_used >= checkpoint.max_tokens
            {
                return self
                    .settle(&mut checkpoint, LoopStatus::BudgetExceeded, &replies, None)
                    .await;
            }
            if Utc::now() >= deadline {
                return self
                    .settle(&mut checkpoint, LoopStatus::Timeout, &replies, None)
                    .await;
            }
            if cancel.is_cancelled() {
                return self
                    .settle(&mut checkpoint, LoopStatus::Cancelled, &replies, None)
                    .await;
            }

            checkpoint.current_step += 1;
            let prompt = self.continuation_prompt(&content, &checkpoint);

            let reply = match self.stream_step(&task.session_id, &checkpoint, &prompt).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(step = checkpoint.current_step, error = %e, "loop step failed");
                    return self
                        .settle(
                            &mut checkpoint,
                            LoopStatus::Failed,
                            &replies,
                            Some(e.to_string()),
                        )
                        .await;
                }
            };

            checkpoint.tokens_used += u64::from(approx_tokens(&reply));
            replies.push(reply.clone());

            self.publish_lifecycle(&checkpoint, |loop_id, task_id, agent_id, step| {
                EventPayload::LoopStep {
                    loop_id,
                    task_id,
                    agent_id,
                    step,
                    max_steps: checkpoint.max_steps,
                }
            })
            .await;

            if reply.contains(&self.config.termination_keyword) {
                return self
                    .settle(&mut checkpoint, LoopStatus::Completed, &replies, None)
                    .await;
            }

            if self.config.checkpoint_interval > 0
                && checkpoint.current_step % self.config.checkpoint_interval == 0
            {
                checkpoint.messages = serde_json::to_string(&replies)?;
                self.loops.save_loop_checkpoint(&checkpoint).await?;
                debug!(step = checkpoint.current_step, "loop checkpoint saved");
            }
        }
    }

    fn continuation_prompt(&self, content: &str, checkpoint: &LoopCheckpoint) -> String {
        format!(
            "{content}\n\n[step {}/{}, tokens ~{}/{}] Continue working. Include {} in your reply when the work is complete.",
            checkpoint.current_step,
            checkpoint.max_steps,
            checkpoint.tokens_used,
            checkpoint.max_tokens,
            self.config.termination_keyword,
        )
    }

    /// Stream one step, forwarding every chunk to the bus and collecting
    /// the full reply.
    async fn stream_step(
        &self,
        session_id: &str,
        checkpoint: &LoopCheckpoint,
        prompt: &str,
    ) -> CoreResult<String> {
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
        let forwarder = {
            let bus = self.bus.clone();
            let task_id = checkpoint.task_id;
            let agent_id = checkpoint.agent_id.clone();
            tokio::spawn(async move {
                while let Some(chunk) = chunk_rx.recv().await {
                    bus.publish(EventPayload::StreamToken {
                        task_id,
                        agent_id: agent_id.clone(),
                        chunk,
                    })
                    .await;
                }
            })
        };

        let mut reply = String::new();
        let outcome = {
            let mut sink = |chunk: &str| -> CoreResult<()> {
                reply.push_str(chunk);
                let _ = chunk_tx.send(chunk.to_string());
                Ok(())
            };
            self.brain.stream(session_id, prompt, &mut sink).await
        };
        drop(chunk_tx);
        let _ = forwarder.await;

        outcome.map(|()| reply)
    }

    async fn settle(
        &self,
        checkpoint: &mut LoopCheckpoint,
        status: LoopStatus,
        replies: &[String],
        error: Option<String>,
    ) -> CoreResult<LoopResult> {
        checkpoint.status = status;
        checkpoint.messages = serde_json::to_string(replies)?;
        self.loops.save_loop_checkpoint(checkpoint).await?;

        let payload = {
            let loop_id = checkpoint.loop_id;
            let task_id = checkpoint.task_id;
            let agent_id = checkpoint.agent_id.clone();
            let step = checkpoint.current_step;
            match status {
                LoopStatus::Completed => Some(EventPayload::LoopCompleted {
                    loop_id,
                    task_id,
                    agent_id,
                    step,
                }),
                LoopStatus::BudgetExceeded => Some(EventPayload::LoopBudgetExceeded {
                    loop_id,
                    task_id,
                    agent_id,
                    step,
                }),
                LoopStatus::Timeout => Some(EventPayload::LoopTimeout {
                    loop_id,
                    task_id,
                    agent_id,
                    step,
                }),
                LoopStatus::Failed => Some(EventPayload::LoopFailed {
                    loop_id,
                    task_id,
                    agent_id,
                    step,
                    error: error.clone().unwrap_or_default(),
                }),
                LoopStatus::Running | LoopStatus::Cancelled => None,
            }
        };
        if let Some(payload) = payload {
            self.bus.publish(payload).await;
        }

        info!(
            loop_id = %checkpoint.loop_id,
            status = status.as_str(),
            steps = checkpoint.current_step,
            tokens = checkpoint.tokens_used,
            "loop settled"
        );
        Ok(LoopResult {
            status,
            steps: checkpoint.current_step,
            tokens_used: checkpoint.tokens_used,
            response: replies.last().cloned().unwrap_or_default(),
            error,
        })
    }

    async fn publish_lifecycle<F>(&self, checkpoint: &LoopCheckpoint, make: F)
    where
        F: FnOnce(Uuid, Uuid, Option<String>, u32) -> EventPayload,
    {
        self.bus
            .publish(make(
                checkpoint.loop_id,
                checkpoint.task_id,
                checkpoint.agent_id.clone(),
                checkpoint.current_step,
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::brains::{MockBrain, MockReply};
    use crate::adapters::sqlite::{
        create_migrated_test_pool, SqliteLoopStore, SqliteTaskStore,
    };

    async fn setup(config: LoopRunnerConfig) -> (LoopRunner, Arc<SqliteTaskStore>, Arc<SqliteLoopStore>, Arc<MockBrain>, Arc<EventBus>) {
        let pool = create_migrated_test_pool().await.unwrap();
        let tasks = Arc::new(SqliteTaskStore::new(pool.clone()));
        tasks.ensure_session("session-1").await.unwrap();
        let loops = Arc::new(SqliteLoopStore::new(pool));
        let brain = Arc::new(MockBrain::new());
        let bus = Arc::new(EventBus::new());
        let runner = LoopRunner::new(
            tasks.clone(),
            loops.clone(),
            brain.clone(),
            bus.clone(),
            config,
        );
        (runner, tasks, loops, brain, bus)
    }

    async fn loop_task(tasks: &SqliteTaskStore) -> Uuid {
        tasks
            .create_task("session-1", &ChatPayload::new("keep working").encode().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_completes_on_termination_keyword() {
        let (runner, tasks, _loops, brain, bus) = setup(LoopRunnerConfig::default()).await;
        let mut events = bus.subscribe("loop.").await;

        brain.push(MockReply::success("still thinking"));
        brain.push(MockReply::success("all done <<LOOP_DONE>>"));

        let task_id = loop_task(&tasks).await;
        let result = runner.run(task_id).await.unwrap();

        assert_eq!(result.status, LoopStatus::Completed);
        assert_eq!(result.steps, 2);
        assert!(result.response.contains("<<LOOP_DONE>>"));
        assert!(result.tokens_used > 0);

        assert_eq!(events.recv().await.unwrap().topic, "loop.started");
        assert_eq!(events.recv().await.unwrap().topic, "loop.step");
        assert_eq!(events.recv().await.unwrap().topic, "loop.step");
        assert_eq!(events.recv().await.unwrap().topic, "loop.completed");
    }

    #[tokio::test]
    async fn test_step_budget_exceeded() {
        let config = LoopRunnerConfig {
            max_steps: 3,
            ..LoopRunnerConfig::default()
        };
        let (runner, tasks, loops, _brain, _bus) = setup(config).await;

        // MockBrain echoes forever; the step budget must stop the loop.
        let task_id = loop_task(&tasks).await;
        let result = runner.run(task_id).await.unwrap();

        assert_eq!(result.status, LoopStatus::BudgetExceeded);
        assert_eq!(result.steps, 3);

        // The settled checkpoint is not resumable.
        assert!(loops.load_loop_checkpoint(task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_token_budget_exceeded() {
        let config = LoopRunnerConfig {
            max_tokens: 5,
            ..LoopRunnerConfig::default()
        };
        let (runner, tasks, _loops, brain, _bus) = setup(config).await;
        brain.push(MockReply::success("a reply comfortably above five tokens in length"));

        let task_id = loop_task(&tasks).await;
        let result = runner.run(task_id).await.unwrap();
        assert_eq!(result.status, LoopStatus::BudgetExceeded);
        assert_eq!(result.steps, 1);
    }

    #[tokio::test]
    async fn test_stream_error_fails_loop() {
        let (runner, tasks, _loops, brain, bus) = setup(LoopRunnerConfig::default()).await;
        let mut events = bus.subscribe("loop.failed").await;
        brain.push(MockReply::failure("rate limit exceeded"));

        let task_id = loop_task(&tasks).await;
        let result = runner.run(task_id).await.unwrap();

        assert_eq!(result.status, LoopStatus::Failed);
        assert!(result.error.unwrap().contains("rate limit"));
        assert_eq!(events.recv().await.unwrap().topic, "loop.failed");
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint_preserves_progress() {
        let config = LoopRunnerConfig {
            max_steps: 4,
            checkpoint_interval: 1,
            ..LoopRunnerConfig::default()
        };
        let (runner, tasks, loops, brain, _bus) = setup(config).await;
        let task_id = loop_task(&tasks).await;

        // Simulate a crashed run that checkpointed at step 2.
        let mut cp = LoopCheckpoint::start(task_id, None, 4, 100_000, 1800);
        cp.current_step = 2;
        cp.tokens_used = 10;
        cp.messages = serde_json::to_string(&["one", "two"]).unwrap();
        loops.save_loop_checkpoint(&cp).await.unwrap();

        brain.push(MockReply::success("finishing <<LOOP_DONE>>"));
        let result = runner.run(task_id).await.unwrap();

        assert_eq!(result.status, LoopStatus::Completed);
        assert_eq!(result.steps, 3); // resumed at 2, ran one more
        assert!(result.tokens_used > 10);
    }

    #[tokio::test]
    async fn test_cancellation_saves_cancelled_checkpoint() {
        let (runner, tasks, _loops, _brain, _bus) = setup(LoopRunnerConfig::default()).await;
        let task_id = loop_task(&tasks).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = runner.run_cancellable(task_id, &cancel).await.unwrap();
        assert_eq!(result.status, LoopStatus::Cancelled);
        assert_eq!(result.steps, 0);
    }

    #[tokio::test]
    async fn test_stream_tokens_forwarded_to_bus() {
        let (runner, tasks, _loops, brain, bus) = setup(LoopRunnerConfig::default()).await;
        let mut stream = bus.subscribe("stream.").await;
        brain.push(MockReply {
            text: "done <<LOOP_DONE>>".to_string(),
            fail: false,
            error_message: None,
            chunk_size: 5,
        });

        let task_id = loop_task(&tasks).await;
        runner.run(task_id).await.unwrap();

        let event = stream.recv().await.unwrap();
        assert_eq!(event.topic, "stream.token");
        assert_eq!(event.payload.task_id(), Some(task_id));
    }
}
