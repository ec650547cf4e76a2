//! Domain models.

pub mod loop_checkpoint;
pub mod plan;
pub mod schedule;
pub mod session;
pub mod task;

pub use loop_checkpoint::{LoopCheckpoint, LoopStatus};
pub use plan::{
    render_prompt, retry_prompt, ExecutionStatus, Plan, PlanExecution, PlanResult, PlanStep,
    StepRecord, StepStatus,
};
pub use schedule::{next_run_after, parse_cron, Schedule};
pub use session::{HistoryItem, Role, Session};
pub use task::{ChatPayload, Task, TaskStatus};
