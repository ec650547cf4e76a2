//! Loop runner checkpoint model.
//!
//! Persisted between iterations so a crashed loop resumes where it left
//! off instead of restarting its budgets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal and in-flight states of an agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Running,
    Completed,
    BudgetExceeded,
    Timeout,
    Failed,
    Cancelled,
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "budget_exceeded" => Some(Self::BudgetExceeded),
            "timeout" => Some(Self::Timeout),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Persisted loop progress. Only `Running` checkpoints are resumable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopCheckpoint {
    pub loop_id: Uuid,
    pub task_id: Uuid,
    pub agent_id: Option<String>,
    pub current_step: u32,
    pub max_steps: u32,
    pub tokens_used: u64,
    pub max_tokens: u64,
    pub started_at: DateTime<Utc>,
    pub max_duration_secs: u64,
    pub status: LoopStatus,
    /// Opaque serialized message state; the runner reads only its own
    /// fields on resume.
    pub messages: String,
}

impl LoopCheckpoint {
    /// Fresh checkpoint for a loop that has not run any steps yet.
    pub fn start(
        task_id: Uuid,
        agent_id: Option<String>,
        max_steps: u32,
        max_tokens: u64,
        max_duration_secs: u64,
    ) -> Self {
        Self {
            loop_id: Uuid::new_v4(),
            task_id,
            agent_id,
            current_step: 0,
            max_steps,
            tokens_used: 0,
            max_tokens,
            started_at: Utc::now(),
            max_duration_secs,
            status: LoopStatus::Running,
            messages: "[]".to_string(),
        }
    }

    /// Wall-clock deadline for the loop.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::seconds(self.max_duration_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            LoopStatus::Running,
            LoopStatus::Completed,
            LoopStatus::BudgetExceeded,
            LoopStatus::Timeout,
            LoopStatus::Failed,
            LoopStatus::Cancelled,
        ] {
            assert_eq!(LoopStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_start_checkpoint() {
        let task_id = Uuid::new_v4();
        let cp = LoopCheckpoint::start(task_id, Some("coder".to_string()), 10, 4000, 600);
        assert_eq!(cp.task_id, task_id);
        assert_eq!(cp.current_step, 0);
        assert_eq!(cp.status, LoopStatus::Running);
        assert!(cp.deadline() > cp.started_at);
    }
}
