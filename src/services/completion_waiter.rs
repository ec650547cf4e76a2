//! Completion waiter: blocks callers until a task settles.
//!
//! Event-driven through the bus for sub-second wake latency, with a
//! polling fallback that covers lost events (full buffers, crashed
//! publisher). Subscribing happens before the initial read to close the
//! window where a task settles between read and subscribe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{interval_at, sleep, Instant};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{Task, TaskStatus};
use crate::domain::ports::TaskStore;
use crate::services::event_bus::{EventBus, Subscription};

/// Poll cadence when bus events provide the fast path.
const POLL_WITH_BUS: Duration = Duration::from_secs(1);
/// Poll cadence when no bus is available.
const POLL_WITHOUT_BUS: Duration = Duration::from_millis(100);

/// Final outcome of a settled task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl From<&Task> for TaskOutcome {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
        }
    }
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

/// Outcome of waiting on a set of tasks: per-task outcomes plus wait-level
/// failures (timeouts, store errors). A task that settled as failed is an
/// outcome, not a wait failure.
#[derive(Debug, Default)]
pub struct WaitReport {
    pub outcomes: HashMap<Uuid, TaskOutcome>,
    pub failures: HashMap<Uuid, CoreError>,
}

impl WaitReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// One aggregate error describing every wait-level failure.
    pub fn aggregate_error(&self) -> Option<CoreError> {
        if self.failures.is_empty() {
            return None;
        }
        let detail: Vec<String> = self
            .failures
            .iter()
            .map(|(id, e)| format!("{id}: {e}"))
            .collect();
        Some(CoreError::Processor(format!(
            "{} wait(s) failed: {}",
            self.failures.len(),
            detail.join("; ")
        )))
    }
}

pub struct CompletionWaiter {
    store: Arc<dyn TaskStore>,
    bus: Option<Arc<EventBus>>,
}

impl CompletionWaiter {
    pub fn new(store: Arc<dyn TaskStore>, bus: Option<Arc<EventBus>>) -> Self {
        Self { store, bus }
    }

    /// Block until the task settles or the wait times out.
    #[instrument(skip(self), err)]
    pub async fn wait_for_task(&self, task_id: Uuid, wait: Duration) -> CoreResult<TaskOutcome> {
        // Subscribe before the first read; an event arriving in between
        // is buffered instead of lost.
        let mut subscription = match &self.bus {
            Some(bus) => Some(bus.subscribe("task.").await),
            None => None,
        };

        let outcome = self.wait_inner(task_id, wait, &mut subscription).await;

        if let (Some(bus), Some(sub)) = (&self.bus, subscription.take()) {
            bus.unsubscribe(sub).await;
        }
        outcome
    }

    async fn wait_inner(
        &self,
        task_id: Uuid,
        wait: Duration,
        subscription: &mut Option<Subscription>,
    ) -> CoreResult<TaskOutcome> {
        if let Some(outcome) = self.read_settled(task_id).await? {
            return Ok(outcome);
        }

        let poll = if subscription.is_some() {
            POLL_WITH_BUS
        } else {
            POLL_WITHOUT_BUS
        };
        let mut ticker = interval_at(Instant::now() + poll, poll);
        let deadline = sleep(wait);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                event = next_event(subscription) => {
                    match event {
                        // Only this task's events warrant a re-read;
                        // everything else on the prefix is noise.
                        Some(e) if e.payload.task_id() == Some(task_id) => {
                            if let Some(outcome) = self.read_settled(task_id).await? {
                                return Ok(outcome);
                            }
                        }
                        Some(_) => {}
                        // Bus side closed; fall back to pure polling.
                        None => *subscription = None,
                    }
                }
                _ = ticker.tick() => {
                    if let Some(outcome) = self.read_settled(task_id).await? {
                        return Ok(outcome);
                    }
                }
                () = &mut deadline => {
                    return Err(CoreError::WaitTimeout(task_id));
                }
            }
        }
    }

    async fn read_settled(&self, task_id: Uuid) -> CoreResult<Option<TaskOutcome>> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(CoreError::TaskNotFound(task_id))?;
        Ok(task.status.is_settled().then(|| TaskOutcome::from(&task)))
    }

    /// Wait on all tasks in parallel. Never aborts on first failure;
    /// returns every outcome gathered plus wait-level failures.
    pub async fn wait_for_all(&self, task_ids: &[Uuid], wait: Duration) -> WaitReport {
        let waits = task_ids.iter().map(|id| {
            let id = *id;
            async move { (id, self.wait_for_task(id, wait).await) }
        });

        let mut report = WaitReport::default();
        for (id, result) in join_all(waits).await {
            match result {
                Ok(outcome) => {
                    report.outcomes.insert(id, outcome);
                }
                Err(e) => {
                    report.failures.insert(id, e);
                }
            }
        }
        report
    }
}

/// Next bus event, or pending forever when no subscription exists (the
/// poll ticker carries the loop in that mode).
async fn next_event(
    subscription: &mut Option<Subscription>,
) -> Option<crate::services::event_bus::Event> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}
