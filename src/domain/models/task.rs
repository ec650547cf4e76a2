//! Task domain model.
//!
//! A task is the unit of work delivered by the engine: claimed under a
//! time-bounded lease, executed by a processor, retried with backoff, and
//! dead-lettered when its retry budget runs out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::ErrorCode;

/// Status of a task in the queue lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed by a worker.
    Queued,
    /// Claimed; exactly one worker holds the lease.
    Running,
    /// Finished successfully; result recorded.
    Succeeded,
    /// Last attempt failed; may re-enter Queued if retries remain.
    Failed,
    /// Aborted before completion.
    Canceled,
    /// Retry budget exhausted; retained for inspection.
    DeadLetter,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::DeadLetter => "dead_letter",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" | "cancelled" => Some(Self::Canceled),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }

    /// Whether no further transition is possible.
    ///
    /// Failed is not listed here: a failed task with retries remaining
    /// re-enters the queue. Callers waiting on completion should use
    /// [`is_settled`](Self::is_settled) instead.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Canceled | Self::DeadLetter)
    }

    /// Whether a waiter should treat this status as a final outcome.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Canceled | Self::DeadLetter
        )
    }

    /// Valid transitions out of this status.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            // Queued -> Running on claim, -> Canceled on abort before claim.
            Self::Queued => &[Self::Running, Self::Canceled],
            // Running -> Queued covers lease expiry and crash recovery.
            Self::Running => &[
                Self::Succeeded,
                Self::Failed,
                Self::Canceled,
                Self::Queued,
                Self::DeadLetter,
            ],
            Self::Failed => &[Self::Queued, Self::DeadLetter],
            Self::Succeeded | Self::Canceled | Self::DeadLetter => &[],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of work owned by the task engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning session (externally-provided opaque id).
    pub session_id: String,
    /// Worker pool scope; None means the global pool.
    pub agent_id: Option<String>,
    /// Opaque payload; interpreted only by the processor.
    pub payload: String,
    /// Current status.
    pub status: TaskStatus,
    /// Monotonic attempt counter, bumped at each attempt start.
    pub attempt: u32,
    /// Signed scheduling priority; higher runs first.
    pub priority: i64,
    /// Worker identity holding the lease, if Running.
    pub lease_owner: Option<String>,
    /// Lease expiry, if Running.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Earliest time a retry may be claimed (backoff gate).
    pub not_before: Option<DateTime<Utc>>,
    /// Cooperative cancellation flag.
    pub cancel_requested: bool,
    /// Opaque result, set on success.
    pub result: Option<String>,
    /// Last error message.
    pub error: Option<String>,
    /// Classification of the last error.
    pub last_error_code: Option<ErrorCode>,
    /// Policy version snapshot pinned at attempt start.
    pub policy_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new queued task for a session.
    pub fn new(session_id: impl Into<String>, payload: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            agent_id: None,
            payload: payload.into(),
            status: TaskStatus::Queued,
            attempt: 0,
            priority: 0,
            lease_owner: None,
            lease_expires_at: None,
            not_before: None,
            cancel_requested: false,
            result: None,
            error: None,
            last_error_code: None,
            policy_version: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Scope the task to an agent pool.
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        self.status.can_transition_to(next)
    }
}

/// Persisted payload envelope for chat tasks.
///
/// `message_depth` is omitted from the wire form when zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub content: String,
    #[serde(default, skip_serializing_if = "depth_is_zero")]
    pub message_depth: u32,
}

fn depth_is_zero(depth: &u32) -> bool {
    *depth == 0
}

impl ChatPayload {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_depth: 0,
        }
    }

    /// Encode to the persisted JSON form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from the persisted JSON form.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_queued() {
        let task = Task::new("session-1", "{\"content\":\"hi\"}");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempt, 0);
        assert!(task.lease_owner.is_none());
        assert!(!task.cancel_requested);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::Canceled,
            TaskStatus::DeadLetter,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::from_str("cancelled"), Some(TaskStatus::Canceled));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
        assert!(TaskStatus::DeadLetter.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
    }

    #[test]
    fn test_settled_includes_failed() {
        assert!(TaskStatus::Failed.is_settled());
        assert!(TaskStatus::Succeeded.is_settled());
        assert!(!TaskStatus::Running.is_settled());
        assert!(!TaskStatus::Queued.is_settled());
    }

    #[test]
    fn test_valid_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Canceled));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Succeeded));

        // Lease expiry re-queues a running task.
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Succeeded));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Canceled));

        // Retry path.
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::DeadLetter));

        // Terminal states never move.
        for terminal in [TaskStatus::Succeeded, TaskStatus::Canceled, TaskStatus::DeadLetter] {
            assert!(terminal.valid_transitions().is_empty());
        }
    }

    #[test]
    fn test_chat_payload_omits_zero_depth() {
        let payload = ChatPayload::new("hello");
        let encoded = payload.encode().unwrap();
        assert_eq!(encoded, r#"{"content":"hello"}"#);

        let decoded = ChatPayload::decode(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_chat_payload_with_depth() {
        let payload = ChatPayload {
            content: "hello".to_string(),
            message_depth: 2,
        };
        let encoded = payload.encode().unwrap();
        assert!(encoded.contains("message_depth"));
        assert_eq!(ChatPayload::decode(&encoded).unwrap().message_depth, 2);
    }
}
