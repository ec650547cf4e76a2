//! In-process event bus: topic-prefix pub/sub with bounded per-subscriber
//! buffers and drop accounting.
//!
//! Delivery is best-effort and at-most-once. Publishers never block and
//! never fail; a stuck subscriber loses events once its buffer is full.
//! Callers that need guarantees read the store through the waiter instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::warn;
use uuid::Uuid;

/// Bounded buffer size of every subscription channel.
pub const SUBSCRIPTION_CAPACITY: usize = 100;

/// Typed payloads; each variant maps to a fixed dot-delimited topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    TaskSucceeded {
        task_id: Uuid,
        session_id: String,
        agent_id: Option<String>,
    },
    TaskFailed {
        task_id: Uuid,
        session_id: String,
        agent_id: Option<String>,
        error: String,
    },
    TaskCanceled {
        task_id: Uuid,
        session_id: String,
        agent_id: Option<String>,
    },
    PlanExecutionStarted {
        execution_id: String,
        plan_name: String,
        total_steps: u32,
    },
    PlanExecutionCompleted {
        execution_id: String,
        status: String,
    },
    PlanStepStarted {
        execution_id: String,
        step_id: String,
        task_id: Uuid,
        agent_id: String,
    },
    PlanStepCompleted {
        execution_id: String,
        step_id: String,
        task_id: Uuid,
        agent_id: String,
    },
    PlanStepFailed {
        execution_id: String,
        step_id: String,
        task_id: Option<Uuid>,
        agent_id: String,
        error: String,
    },
    StreamToken {
        task_id: Uuid,
        agent_id: Option<String>,
        chunk: String,
    },
    LoopStarted {
        loop_id: Uuid,
        task_id: Uuid,
        agent_id: Option<String>,
        step: u32,
        max_steps: u32,
    },
    LoopStep {
        loop_id: Uuid,
        task_id: Uuid,
        agent_id: Option<String>,
        step: u32,
        max_steps: u32,
    },
    LoopCompleted {
        loop_id: Uuid,
        task_id: Uuid,
        agent_id: Option<String>,
        step: u32,
    },
    LoopBudgetExceeded {
        loop_id: Uuid,
        task_id: Uuid,
        agent_id: Option<String>,
        step: u32,
    },
    LoopTimeout {
        loop_id: Uuid,
        task_id: Uuid,
        agent_id: Option<String>,
        step: u32,
    },
    LoopFailed {
        loop_id: Uuid,
        task_id: Uuid,
        agent_id: Option<String>,
        step: u32,
        error: String,
    },
    ApprovalRequested {
        request_id: Uuid,
        execution_id: Option<String>,
        step_id: Option<String>,
        prompt: Option<String>,
        action: String,
    },
    ApprovalResponse {
        request_id: Uuid,
        execution_id: Option<String>,
        step_id: Option<String>,
        action: String,
    },
    ScheduleFired {
        schedule_id: Uuid,
        name: String,
        task_id: Uuid,
    },
}

impl EventPayload {
    /// The dot-delimited topic this payload is published under.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::TaskSucceeded { .. } => "task.succeeded",
            Self::TaskFailed { .. } => "task.failed",
            Self::TaskCanceled { .. } => "task.canceled",
            Self::PlanExecutionStarted { .. } => "plan.execution.started",
            Self::PlanExecutionCompleted { .. } => "plan.execution.completed",
            Self::PlanStepStarted { .. } => "plan.step.started",
            Self::PlanStepCompleted { .. } => "plan.step.completed",
            Self::PlanStepFailed { .. } => "plan.step.failed",
            Self::StreamToken { .. } => "stream.token",
            Self::LoopStarted { .. } => "loop.started",
            Self::LoopStep { .. } => "loop.step",
            Self::LoopCompleted { .. } => "loop.completed",
            Self::LoopBudgetExceeded { .. } => "loop.budget_exceeded",
            Self::LoopTimeout { .. } => "loop.timeout",
            Self::LoopFailed { .. } => "loop.failed",
            Self::ApprovalRequested { .. } => "hitl.approval.requested",
            Self::ApprovalResponse { .. } => "hitl.approval.response",
            Self::ScheduleFired { .. } => "schedule.fired",
        }
    }

    /// Task id carried by task-lifecycle payloads, used by the waiter.
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Self::TaskSucceeded { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskCanceled { task_id, .. }
            | Self::PlanStepStarted { task_id, .. }
            | Self::PlanStepCompleted { task_id, .. }
            | Self::StreamToken { task_id, .. }
            | Self::LoopStarted { task_id, .. }
            | Self::LoopStep { task_id, .. }
            | Self::LoopCompleted { task_id, .. }
            | Self::LoopBudgetExceeded { task_id, .. }
            | Self::LoopTimeout { task_id, .. }
            | Self::LoopFailed { task_id, .. }
            | Self::ScheduleFired { task_id, .. } => Some(*task_id),
            Self::PlanStepFailed { task_id, .. } => *task_id,
            _ => None,
        }
    }
}

/// Event envelope delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

/// A live subscription: receive-only bounded channel plus identity.
pub struct Subscription {
    id: u64,
    prefix: String,
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Receive the next event; None when the bus side is closed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}

struct SubscriberEntry {
    prefix: String,
    sender: mpsc::Sender<Event>,
}

/// Central in-process broadcast bus.
pub struct EventBus {
    subscribers: RwLock<HashMap<u64, SubscriberEntry>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscription matching every topic that starts with
    /// `prefix`. The empty prefix matches all topics.
    pub async fn subscribe(&self, prefix: &str) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().await.insert(
            id,
            SubscriberEntry {
                prefix: prefix.to_string(),
                sender,
            },
        );
        Subscription {
            id,
            prefix: prefix.to_string(),
            receiver,
        }
    }

    /// Remove a subscription and close its channel.
    pub async fn unsubscribe(&self, subscription: Subscription) {
        self.subscribers.write().await.remove(&subscription.id);
        // Dropping `subscription` closes the receiving side exactly once.
    }

    /// Best-effort fan-out; never blocks and never fails. Full buffers
    /// count as drops, with a warning at every power-of-ten boundary.
    pub async fn publish(&self, payload: EventPayload) {
        let event = Event {
            topic: payload.topic().to_string(),
            timestamp: Utc::now(),
            payload,
        };

        let mut closed: Vec<u64> = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, entry) in subscribers.iter() {
                if !event.topic.starts_with(entry.prefix.as_str()) {
                    continue;
                }
                match entry.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if is_power_of_ten(total) {
                            warn!(
                                topic = %event.topic,
                                dropped_total = total,
                                subscription_id = id,
                                "Event bus dropping events for slow subscriber"
                            );
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(*id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub fn dropped_event_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn is_power_of_ten(n: u64) -> bool {
    let mut value = 1u64;
    loop {
        if value == n {
            return true;
        }
        if value > n / 10 {
            return false;
        }
        value *= 10;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn succeeded(task_id: Uuid) -> EventPayload {
        EventPayload::TaskSucceeded {
            task_id,
            session_id: "session-1".to_string(),
            agent_id: None,
        }
    }

    #[tokio::test]
    async fn test_prefix_matching() {
        let bus = EventBus::new();
        let mut all = bus.subscribe("").await;
        let mut tasks = bus.subscribe("task.").await;
        let mut plans = bus.subscribe("plan.").await;

        let id = Uuid::new_v4();
        bus.publish(succeeded(id)).await;

        assert_eq!(all.recv().await.unwrap().topic, "task.succeeded");
        assert_eq!(tasks.recv().await.unwrap().payload.task_id(), Some(id));
        // The plan subscriber saw nothing.
        assert!(plans.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_single_publisher_ordering() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("task.").await;

        let ids: Vec<Uuid> = (0..10).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            bus.publish(succeeded(*id)).await;
        }

        for id in &ids {
            assert_eq!(sub.recv().await.unwrap().payload.task_id(), Some(*id));
        }
    }

    #[tokio::test]
    async fn test_drop_on_overflow() {
        let bus = EventBus::new();
        let _sub = bus.subscribe("task.").await;

        for _ in 0..(SUBSCRIPTION_CAPACITY + 7) {
            bus.publish(succeeded(Uuid::new_v4())).await;
        }

        assert_eq!(bus.dropped_event_count(), 7);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_entry() {
        let bus = EventBus::new();
        let sub = bus.subscribe("task.").await;
        assert_eq!(bus.subscriber_count().await, 1);

        bus.unsubscribe(sub).await;
        assert_eq!(bus.subscriber_count().await, 0);

        // Publishing with no subscribers is a no-op.
        bus.publish(succeeded(Uuid::new_v4())).await;
        assert_eq!(bus.dropped_event_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe("").await;
        drop(sub.receiver);

        bus.publish(succeeded(Uuid::new_v4())).await;
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[test]
    fn test_is_power_of_ten() {
        assert!(is_power_of_ten(1));
        assert!(is_power_of_ten(10));
        assert!(is_power_of_ten(100));
        assert!(is_power_of_ten(1000));
        assert!(!is_power_of_ten(0));
        assert!(!is_power_of_ten(2));
        assert!(!is_power_of_ten(11));
        assert!(!is_power_of_ten(999));
    }

    #[test]
    fn test_topic_names() {
        let payload = EventPayload::ApprovalRequested {
            request_id: Uuid::new_v4(),
            execution_id: None,
            step_id: None,
            prompt: None,
            action: "approve".to_string(),
        };
        assert_eq!(payload.topic(), "hitl.approval.requested");
        assert_eq!(payload.task_id(), None);
    }
}
