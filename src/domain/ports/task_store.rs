//! Task store port: durable task/session/lease state.
//!
//! The engine, waiter, and plan executor depend only on this surface.
//! Every mutation of a running task is a conditional update keyed on
//! `(task_id, lease_owner)` so stale writers are rejected by the store.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::{CoreResult, ErrorCode};
use crate::domain::models::{HistoryItem, Role, Task, TaskStatus};

/// Repository interface for sessions, history, and the task queue.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create the session row if it does not exist.
    async fn ensure_session(&self, session_id: &str) -> CoreResult<()>;

    /// Append a conversation turn; returns the history item id.
    async fn add_history(
        &self,
        session_id: &str,
        agent_id: Option<&str>,
        role: Role,
        content: &str,
        tokens: u32,
    ) -> CoreResult<i64>;

    /// Most recent unarchived turns, oldest first.
    async fn list_history(&self, session_id: &str, limit: usize) -> CoreResult<Vec<HistoryItem>>;

    /// Mark turns up to and including `up_to_id` as archived; returns the
    /// number affected.
    async fn archive_messages(&self, session_id: &str, up_to_id: i64) -> CoreResult<u64>;

    /// Insert a queued task for the global pool.
    async fn create_task(&self, session_id: &str, payload: &str) -> CoreResult<Uuid>;

    /// Insert a queued task scoped to an agent pool.
    async fn create_task_for_agent(
        &self,
        agent_id: &str,
        session_id: &str,
        payload: &str,
    ) -> CoreResult<Uuid>;

    async fn get_task(&self, id: Uuid) -> CoreResult<Option<Task>>;

    async fn list_tasks_by_session(&self, session_id: &str) -> CoreResult<Vec<Task>>;

    /// Atomically claim the highest-priority queued global task (ties by
    /// oldest creation), transitioning it to Running under a fresh lease.
    async fn claim_next_pending_task(
        &self,
        lease_owner: &str,
        lease_ttl: Duration,
    ) -> CoreResult<Option<Task>>;

    /// Agent-scoped variant of [`claim_next_pending_task`](Self::claim_next_pending_task).
    async fn claim_next_pending_task_for_agent(
        &self,
        agent_id: &str,
        lease_owner: &str,
        lease_ttl: Duration,
    ) -> CoreResult<Option<Task>>;

    /// Claim one specific queued task (synchronous streaming path).
    /// Returns false when the task is not claimable.
    async fn claim_task(&self, id: Uuid, lease_owner: &str, lease_ttl: Duration)
        -> CoreResult<bool>;

    /// Bump the attempt counter, pin the policy version, and stamp the
    /// attempt start. Returns the new attempt number.
    async fn start_task_run(
        &self,
        id: Uuid,
        lease_owner: &str,
        policy_version: &str,
    ) -> CoreResult<u32>;

    /// Extend the lease. Returns false when the caller no longer owns it.
    async fn heartbeat_lease(
        &self,
        id: Uuid,
        lease_owner: &str,
        lease_ttl: Duration,
    ) -> CoreResult<bool>;

    /// Record success. Rejected with `LeaseLost` for stale owners.
    async fn complete_task(&self, id: Uuid, lease_owner: &str, result: &str) -> CoreResult<()>;

    /// Record a failed attempt: re-queue with exponential backoff when
    /// attempts remain, otherwise dead-letter. Returns the resulting status.
    async fn handle_task_failure(
        &self,
        id: Uuid,
        lease_owner: &str,
        error: &str,
        code: ErrorCode,
        max_attempts: u32,
    ) -> CoreResult<TaskStatus>;

    /// Request cancellation. A queued task is canceled outright; a running
    /// task gets `cancel_requested` set for its owner to observe. Returns
    /// true if any state changed.
    async fn abort_task(&self, id: Uuid) -> CoreResult<bool>;

    /// Finalize a running task to Canceled under lease ownership.
    async fn cancel_task(&self, id: Uuid, lease_owner: &str) -> CoreResult<bool>;

    async fn is_cancel_requested(&self, id: Uuid) -> CoreResult<bool>;

    /// Startup recovery: every Running task returns to Queued with its
    /// attempt unchanged. Returns the number recovered.
    async fn recover_running_tasks(&self) -> CoreResult<u64>;

    /// Re-queue Running tasks whose lease has expired, attempt unchanged.
    async fn requeue_expired_leases(&self) -> CoreResult<u64>;

    /// Anti-starvation: raise the priority of queued tasks older than the
    /// threshold. Returns the number aged.
    async fn age_queued_priorities(
        &self,
        older_than: Duration,
        increment: i64,
    ) -> CoreResult<u64>;

    /// Queued depth of the global pool.
    async fn queue_depth(&self) -> CoreResult<u64>;

    /// Queued depth of one agent pool.
    async fn queue_depth_for_agent(&self, agent_id: &str) -> CoreResult<u64>;
}
