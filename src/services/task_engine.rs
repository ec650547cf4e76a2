//! Task engine: a pool of workers delivering each queued task exactly
//! once to at most one worker at a time.
//!
//! Workers claim under a time-bounded lease, execute through an injected
//! [`Processor`], extend the lease from a heartbeat task, and settle the
//! attempt with conditional store writes so a stale worker can never
//! overwrite another's result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult, ErrorCode};
use crate::domain::models::{ChatPayload, Role, Task, TaskStatus};
use crate::domain::ports::{Processor, RunContext, TaskStore};
use crate::services::event_bus::{EventBus, EventPayload};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Agent pool this engine claims for; None claims the global pool.
    pub agent_id: Option<String>,
    /// Concurrent workers.
    pub workers: usize,
    /// Sleep between claim attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Lease TTL granted on claim and on each heartbeat.
    pub lease_ttl: Duration,
    /// Lease extension cadence.
    pub heartbeat_interval: Duration,
    /// Per-attempt deadline.
    pub task_timeout: Duration,
    /// Attempts before dead-lettering.
    pub max_attempts: u32,
    /// Intake backpressure limit; 0 disables the check.
    pub max_queue_depth: u64,
    /// Queued tasks older than this get their priority raised.
    pub aging_threshold: Duration,
    /// Priority increment applied by aging.
    pub aging_increment: i64,
    /// Policy version pinned on each attempt.
    pub policy_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_id: None,
            workers: 4,
            poll_interval: Duration::from_millis(500),
            lease_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            task_timeout: Duration::from_secs(600),
            max_attempts: 3,
            max_queue_depth: 0,
            aging_threshold: Duration::from_secs(60),
            aging_increment: 1,
            policy_version: "v1".to_string(),
        }
    }
}

/// Point-in-time engine snapshot.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub agent_id: Option<String>,
    pub worker_count: usize,
    pub active_tasks: usize,
    pub last_error: Option<String>,
}

/// Result of a synchronously streamed chat task.
#[derive(Debug, Clone)]
pub struct StreamedChat {
    pub task_id: Uuid,
    pub reply: String,
}

/// Shared state handed to worker loops.
#[derive(Clone)]
struct WorkerContext {
    store: Arc<dyn TaskStore>,
    processor: Arc<dyn Processor>,
    bus: Arc<EventBus>,
    config: EngineConfig,
    /// Stops claim loops; in-flight tasks keep running (drain).
    stop: CancellationToken,
    /// Parent of every per-task scope; cancelled on hard shutdown.
    kill: CancellationToken,
    /// Scoped cancellation handles keyed by task id. Leaf lock, never
    /// held across await.
    active: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl WorkerContext {
    fn record_error(&self, error: impl Into<String>) {
        let error = error.into();
        warn!(error = %error, "engine error recorded");
        *self.last_error.lock().expect("last_error lock") = Some(error);
    }
}

/// Outcome of one processor attempt, before store settlement.
enum AttemptOutcome {
    Success(String),
    Failure(CoreError),
    TimedOut(String),
    Cancelled,
}

pub struct TaskEngine {
    ctx: WorkerContext,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        processor: Arc<dyn Processor>,
        bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        let kill = CancellationToken::new();
        Self {
            ctx: WorkerContext {
                store,
                processor,
                bus,
                config,
                stop: CancellationToken::new(),
                kill,
                active: Arc::new(Mutex::new(HashMap::new())),
                last_error: Arc::new(Mutex::new(None)),
            },
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Recover tasks stranded in Running by a previous process, then
    /// spawn the worker pool.
    pub async fn start(&self) -> CoreResult<()> {
        let recovered = self.ctx.store.recover_running_tasks().await?;
        if recovered > 0 {
            info!(recovered, "requeued tasks stranded by previous run");
        }

        let mut workers = self.workers.lock().expect("workers lock");
        for n in 0..self.ctx.config.workers {
            let ctx = self.ctx.clone();
            workers.push(tokio::spawn(worker_loop(ctx, n)));
        }
        info!(
            workers = self.ctx.config.workers,
            agent_id = self.ctx.config.agent_id.as_deref().unwrap_or("global"),
            "task engine started"
        );
        Ok(())
    }

    /// Create a chat task in the global pool.
    #[instrument(skip(self, content), err)]
    pub async fn create_chat_task(&self, session_id: &str, content: &str) -> CoreResult<Uuid> {
        self.create_chat_inner(None, session_id, content).await
    }

    /// Create a chat task scoped to an agent pool.
    #[instrument(skip(self, content), err)]
    pub async fn create_chat_task_for_agent(
        &self,
        agent_id: &str,
        session_id: &str,
        content: &str,
    ) -> CoreResult<Uuid> {
        self.create_chat_inner(Some(agent_id), session_id, content)
            .await
    }

    async fn create_chat_inner(
        &self,
        agent_id: Option<&str>,
        session_id: &str,
        content: &str,
    ) -> CoreResult<Uuid> {
        self.check_backpressure(agent_id).await?;

        self.ctx.store.ensure_session(session_id).await?;
        self.ctx
            .store
            .add_history(session_id, agent_id, Role::User, content, approx_tokens(content))
            .await?;

        let payload = ChatPayload::new(content).encode()?;
        match agent_id {
            Some(agent) => {
                self.ctx
                    .store
                    .create_task_for_agent(agent, session_id, &payload)
                    .await
            }
            None => self.ctx.store.create_task(session_id, &payload).await,
        }
    }

    async fn check_backpressure(&self, agent_id: Option<&str>) -> CoreResult<()> {
        let limit = self.ctx.config.max_queue_depth;
        if limit == 0 {
            return Ok(());
        }
        let (scope, depth) = match agent_id {
            Some(agent) => (
                agent.to_string(),
                self.ctx.store.queue_depth_for_agent(agent).await?,
            ),
            None => ("global".to_string(), self.ctx.store.queue_depth().await?),
        };
        if depth >= limit {
            return Err(CoreError::QueueSaturated { scope, depth, limit });
        }
        Ok(())
    }

    /// Create a chat task, then synchronously drive a streaming processor,
    /// delivering each chunk to `on_chunk`. The task id is fixed before
    /// streaming begins; the task is completed on success and failed on
    /// error.
    pub async fn stream_chat_task<F>(
        &self,
        session_id: &str,
        content: &str,
        on_chunk: F,
    ) -> CoreResult<StreamedChat>
    where
        F: FnMut(&str) + Send,
    {
        self.stream_chat_inner(None, session_id, content, on_chunk)
            .await
    }

    /// Agent-scoped variant of [`stream_chat_task`](Self::stream_chat_task).
    pub async fn stream_chat_task_for_agent<F>(
        &self,
        agent_id: &str,
        session_id: &str,
        content: &str,
        on_chunk: F,
    ) -> CoreResult<StreamedChat>
    where
        F: FnMut(&str) + Send,
    {
        self.stream_chat_inner(Some(agent_id), session_id, content, on_chunk)
            .await
    }

    async fn stream_chat_inner<F>(
        &self,
        agent_id: Option<&str>,
        session_id: &str,
        content: &str,
        mut on_chunk: F,
    ) -> CoreResult<StreamedChat>
    where
        F: FnMut(&str) + Send,
    {
        let ctx = &self.ctx;
        let task_id = self.create_chat_inner(agent_id, session_id, content).await?;
        let lease_owner = format!("stream-{}", Uuid::new_v4());

        if !ctx
            .store
            .claim_task(task_id, &lease_owner, ctx.config.lease_ttl)
            .await?
        {
            return Err(CoreError::LeaseLost {
                task_id,
                lease_owner,
            });
        }
        let task = ctx
            .store
            .get_task(task_id)
            .await?
            .ok_or(CoreError::TaskNotFound(task_id))?;

        let attempt = ctx
            .store
            .start_task_run(task_id, &lease_owner, &ctx.config.policy_version)
            .await?;

        let scope = ctx.kill.child_token();
        ctx.active
            .lock()
            .expect("active lock")
            .insert(task_id, scope.clone());

        let deadline = Utc::now()
            + chrono::Duration::from_std(ctx.config.task_timeout)
                .unwrap_or(chrono::Duration::seconds(600));
        let run_ctx = RunContext::new(scope.clone(), deadline, format!("{task_id}-a{attempt}"));
        let heartbeat = spawn_heartbeat(ctx.clone(), task_id, lease_owner.clone(), scope.clone());

        // Forward chunks to the bus off the synchronous sink.
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
        let forwarder = {
            let bus = ctx.bus.clone();
            let agent = task.agent_id.clone();
            tokio::spawn(async move {
                while let Some(chunk) = chunk_rx.recv().await {
                    bus.publish(EventPayload::StreamToken {
                        task_id,
                        agent_id: agent.clone(),
                        chunk,
                    })
                    .await;
                }
            })
        };

        let outcome = {
            let mut sink = |chunk: &str| -> CoreResult<()> {
                on_chunk(chunk);
                let _ = chunk_tx.send(chunk.to_string());
                Ok(())
            };
            let processing =
                ctx.processor
                    .process_streaming(&run_ctx, &task, &mut sink);
            tokio::select! {
                () = scope.cancelled() => AttemptOutcome::Cancelled,
                result = timeout(ctx.config.task_timeout, processing) => match result {
                    Ok(Ok(reply)) => AttemptOutcome::Success(reply),
                    Ok(Err(e)) => AttemptOutcome::Failure(e),
                    Err(_) => AttemptOutcome::TimedOut("streaming processor".to_string()),
                },
            }
        };
        drop(chunk_tx);
        let _ = forwarder.await;
        heartbeat.abort();

        let settled = settle_attempt(ctx, &task, &lease_owner, &run_ctx, outcome).await;
        ctx.active.lock().expect("active lock").remove(&task_id);

        match settled? {
            (TaskStatus::Succeeded, Some(reply)) => Ok(StreamedChat { task_id, reply }),
            (status, _) => Err(CoreError::Processor(format!(
                "streamed task {task_id} settled as {status}"
            ))),
        }
    }

    /// Request cancellation: set the store flag and preempt the owning
    /// worker when it lives in this process. Returns true if either
    /// effect occurred.
    #[instrument(skip(self))]
    pub async fn abort_task(&self, task_id: Uuid) -> CoreResult<bool> {
        let stored = self.ctx.store.abort_task(task_id).await?;
        let local = {
            let active = self.ctx.active.lock().expect("active lock");
            active.get(&task_id).map(CancellationToken::clone)
        };
        if let Some(token) = &local {
            token.cancel();
        }
        Ok(stored || local.is_some())
    }

    /// Point-in-time status snapshot.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            agent_id: self.ctx.config.agent_id.clone(),
            worker_count: self.workers.lock().expect("workers lock").len(),
            active_tasks: self.ctx.active.lock().expect("active lock").len(),
            last_error: self.ctx.last_error.lock().expect("last_error lock").clone(),
        }
    }

    /// Stop claiming new work and wait up to `wait` for in-flight tasks
    /// to finish. Survivors are recovered later via their stale leases.
    pub async fn drain(&self, wait: Duration) {
        self.ctx.stop.cancel();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let active = self.ctx.active.lock().expect("active lock").len();
            if active == 0 || tokio::time::Instant::now() >= deadline {
                if active > 0 {
                    warn!(active, "drain timeout; leaving tasks to lease recovery");
                }
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Hard shutdown: stop claiming and cancel every in-flight scope.
    /// Results produced after this point are discarded, never written.
    pub fn shutdown(&self) {
        self.ctx.stop.cancel();
        self.ctx.kill.cancel();
    }
}

/// Estimate tokens as ceil(len / 4).
pub fn approx_tokens(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}

async fn worker_loop(ctx: WorkerContext, n: usize) {
    let scope = ctx.config.agent_id.as_deref().unwrap_or("global");
    let worker_id = format!("{scope}-w{n}-{}", &Uuid::new_v4().to_string()[..8]);
    debug!(worker_id = %worker_id, "worker started");

    loop {
        if ctx.stop.is_cancelled() {
            break;
        }

        // Queue maintenance: reclaim stale leases and fight starvation.
        if let Err(e) = ctx.store.requeue_expired_leases().await {
            ctx.record_error(format!("requeue_expired_leases: {e}"));
        }
        if let Err(e) = ctx
            .store
            .age_queued_priorities(ctx.config.aging_threshold, ctx.config.aging_increment)
            .await
        {
            ctx.record_error(format!("age_queued_priorities: {e}"));
        }

        let claimed = match &ctx.config.agent_id {
            Some(agent) => {
                ctx.store
                    .claim_next_pending_task_for_agent(agent, &worker_id, ctx.config.lease_ttl)
                    .await
            }
            None => {
                ctx.store
                    .claim_next_pending_task(&worker_id, ctx.config.lease_ttl)
                    .await
            }
        };

        match claimed {
            Ok(Some(task)) => {
                run_claimed_task(&ctx, task, &worker_id).await;
            }
            Ok(None) => {
                tokio::select! {
                    () = ctx.stop.cancelled() => break,
                    () = sleep(ctx.config.poll_interval) => {}
                }
            }
            Err(e) => {
                ctx.record_error(format!("claim: {e}"));
                tokio::select! {
                    () = ctx.stop.cancelled() => break,
                    () = sleep(ctx.config.poll_interval) => {}
                }
            }
        }
    }
    debug!(worker_id = %worker_id, "worker stopped");
}

async fn run_claimed_task(ctx: &WorkerContext, task: Task, worker_id: &str) {
    let task_id = task.id;
    let scope = ctx.kill.child_token();
    ctx.active
        .lock()
        .expect("active lock")
        .insert(task_id, scope.clone());

    if let Err(e) = run_attempt(ctx, &task, worker_id, scope).await {
        ctx.record_error(format!("task {task_id}: {e}"));
    }

    ctx.active.lock().expect("active lock").remove(&task_id);
}

async fn run_attempt(
    ctx: &WorkerContext,
    task: &Task,
    worker_id: &str,
    scope: CancellationToken,
) -> CoreResult<()> {
    let task_id = task.id;
    let attempt = ctx
        .store
        .start_task_run(task_id, worker_id, &ctx.config.policy_version)
        .await?;

    // Abort before spending processor work on a doomed attempt.
    let pre_cancelled = task.cancel_requested
        || ctx.store.is_cancel_requested(task_id).await.unwrap_or(false)
        || ctx.kill.is_cancelled();
    if pre_cancelled {
        if ctx.store.cancel_task(task_id, worker_id).await? {
            publish_canceled(ctx, task).await;
        }
        return Ok(());
    }

    let deadline = Utc::now()
        + chrono::Duration::from_std(ctx.config.task_timeout)
            .unwrap_or(chrono::Duration::seconds(600));
    let run_ctx = RunContext::new(scope.clone(), deadline, format!("{task_id}-a{attempt}"));
    let heartbeat = spawn_heartbeat(ctx.clone(), task_id, worker_id.to_string(), scope.clone());

    let outcome = {
        let processing = ctx.processor.process(&run_ctx, task);
        tokio::select! {
            () = scope.cancelled() => AttemptOutcome::Cancelled,
            result = timeout(ctx.config.task_timeout, processing) => match result {
                Ok(Ok(reply)) => AttemptOutcome::Success(reply),
                Ok(Err(e)) => AttemptOutcome::Failure(e),
                Err(_) => AttemptOutcome::TimedOut("processor".to_string()),
            },
        }
    };
    heartbeat.abort();

    settle_attempt(ctx, task, worker_id, &run_ctx, outcome).await?;
    Ok(())
}

/// Extend the lease every heartbeat interval; trigger local cancellation
/// when the store-side abort flag is observed. Exits when the task scope
/// ends or the lease is lost.
fn spawn_heartbeat(
    ctx: WorkerContext,
    task_id: Uuid,
    lease_owner: String,
    scope: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(ctx.config.heartbeat_interval);
        ticker.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                () = scope.cancelled() => break,
                _ = ticker.tick() => {
                    match ctx
                        .store
                        .heartbeat_lease(task_id, &lease_owner, ctx.config.lease_ttl)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            // The claim will be lost to re-claim; stop extending.
                            ctx.record_error(format!(
                                "heartbeat: task {task_id} is not owned by {lease_owner}"
                            ));
                            break;
                        }
                        Err(e) => {
                            ctx.record_error(format!("heartbeat: {e}"));
                        }
                    }

                    match ctx.store.is_cancel_requested(task_id).await {
                        Ok(true) => {
                            scope.cancel();
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            ctx.record_error(format!("is_cancel_requested: {e}"));
                        }
                    }
                }
            }
        }
    })
}

/// Settle one attempt in the store and emit the matching lifecycle event.
/// Returns the resulting status and, on success, the reply.
async fn settle_attempt(
    ctx: &WorkerContext,
    task: &Task,
    lease_owner: &str,
    run_ctx: &RunContext,
    outcome: AttemptOutcome,
) -> CoreResult<(TaskStatus, Option<String>)> {
    let task_id = task.id;
    match outcome {
        AttemptOutcome::Success(reply) => {
            if run_ctx.is_cancelled() || run_ctx.deadline_exceeded() {
                // Context ended while the result was in flight; the
                // success must not be written.
                let code = if run_ctx.deadline_exceeded() {
                    ErrorCode::Timeout
                } else {
                    ErrorCode::Unknown
                };
                let status = ctx
                    .store
                    .handle_task_failure(
                        task_id,
                        lease_owner,
                        "skip complete after context end",
                        code,
                        ctx.config.max_attempts,
                    )
                    .await?;
                publish_failure_if_settled(ctx, task, status, "skip complete after context end")
                    .await;
                return Ok((status, None));
            }

            ctx.store.complete_task(task_id, lease_owner, &reply).await?;
            ctx.bus
                .publish(EventPayload::TaskSucceeded {
                    task_id,
                    session_id: task.session_id.clone(),
                    agent_id: task.agent_id.clone(),
                })
                .await;
            Ok((TaskStatus::Succeeded, Some(reply)))
        }
        AttemptOutcome::Cancelled => {
            if ctx.store.cancel_task(task_id, lease_owner).await? {
                publish_canceled(ctx, task).await;
            }
            Ok((TaskStatus::Canceled, None))
        }
        AttemptOutcome::TimedOut(what) => {
            let error = format!(
                "timeout exceeded: {what} ran past {}s",
                ctx.config.task_timeout.as_secs()
            );
            let status = ctx
                .store
                .handle_task_failure(
                    task_id,
                    lease_owner,
                    &error,
                    ErrorCode::Timeout,
                    ctx.config.max_attempts,
                )
                .await?;
            publish_failure_if_settled(ctx, task, status, &error).await;
            Ok((status, None))
        }
        AttemptOutcome::Failure(e) => {
            if run_ctx.is_cancelled() && !run_ctx.deadline_exceeded() {
                // Explicit abort surfaced as a processor error.
                if ctx.store.cancel_task(task_id, lease_owner).await? {
                    publish_canceled(ctx, task).await;
                }
                return Ok((TaskStatus::Canceled, None));
            }
            let error = if run_ctx.deadline_exceeded() {
                format!("timeout exceeded: {e}")
            } else {
                e.to_string()
            };
            let code = if run_ctx.deadline_exceeded() {
                ErrorCode::Timeout
            } else {
                ErrorCode::classify(&error)
            };
            let status = ctx
                .store
                .handle_task_failure(task_id, lease_owner, &error, code, ctx.config.max_attempts)
                .await?;
            publish_failure_if_settled(ctx, task, status, &error).await;
            Ok((status, None))
        }
    }
}

async fn publish_canceled(ctx: &WorkerContext, task: &Task) {
    ctx.bus
        .publish(EventPayload::TaskCanceled {
            task_id: task.id,
            session_id: task.session_id.clone(),
            agent_id: task.agent_id.clone(),
        })
        .await;
}

/// Emit `task.failed` only when the failure settles (no retry pending).
async fn publish_failure_if_settled(
    ctx: &WorkerContext,
    task: &Task,
    status: TaskStatus,
    error: &str,
) {
    if matches!(status, TaskStatus::Failed | TaskStatus::DeadLetter) {
        ctx.bus
            .publish(EventPayload::TaskFailed {
                task_id: task.id,
                session_id: task.session_id.clone(),
                agent_id: task.agent_id.clone(),
                error: error.to_string(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteTaskStore};
    use async_trait::async_trait;

    struct EchoProcessor;

    #[async_trait]
    impl Processor for EchoProcessor {
        async fn process(&self, _ctx: &RunContext, task: &Task) -> CoreResult<String> {
            let payload = ChatPayload::decode(&task.payload)?;
            Ok(format!("ok: {}", payload.content))
        }
    }

    struct FailingProcessor;

    #[async_trait]
    impl Processor for FailingProcessor {
        async fn process(&self, _ctx: &RunContext, _task: &Task) -> CoreResult<String> {
            Err(CoreError::Processor("401 unauthorized".to_string()))
        }
    }

    struct BlockingProcessor;

    #[async_trait]
    impl Processor for BlockingProcessor {
        async fn process(&self, ctx: &RunContext, _task: &Task) -> CoreResult<String> {
            ctx.cancellation().cancelled().await;
            Err(CoreError::Cancelled("processor observed cancellation".to_string()))
        }
    }

    async fn engine_with(
        processor: Arc<dyn Processor>,
        config: EngineConfig,
    ) -> (TaskEngine, Arc<SqliteTaskStore>, Arc<EventBus>) {
        let pool = create_migrated_test_pool().await.unwrap();
        let store = Arc::new(
            SqliteTaskStore::new(pool).with_retry_backoff(Duration::from_millis(1)),
        );
        let bus = Arc::new(EventBus::new());
        let engine = TaskEngine::new(store.clone(), processor, bus.clone(), config);
        (engine, store, bus)
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            workers: 2,
            poll_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(50),
            task_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        }
    }

    async fn wait_for_status(
        store: &SqliteTaskStore,
        id: Uuid,
        expected: TaskStatus,
        deadline_ms: u64,
    ) -> Task {
        use crate::domain::ports::TaskStore as _;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
        loop {
            let task = store.get_task(id).await.unwrap().unwrap();
            if task.status == expected {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {id} stuck in {:?}, wanted {expected:?}",
                task.status
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_worker_processes_task_to_success() {
        let (engine, store, bus) = engine_with(Arc::new(EchoProcessor), fast_config()).await;
        let mut events = bus.subscribe("task.").await;

        engine.start().await.unwrap();
        let id = engine.create_chat_task("session-1", "hello").await.unwrap();

        let task = wait_for_status(&store, id, TaskStatus::Succeeded, 3000).await;
        assert_eq!(task.result.as_deref(), Some("ok: hello"));
        assert_eq!(task.attempt, 1);
        assert!(task.lease_owner.is_none());

        let event = events.recv().await.unwrap();
        assert_eq!(event.topic, "task.succeeded");
        assert_eq!(event.payload.task_id(), Some(id));

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_failures_exhaust_into_dead_letter() {
        let (engine, store, _bus) = engine_with(Arc::new(FailingProcessor), fast_config()).await;
        engine.start().await.unwrap();

        let id = engine.create_chat_task("session-1", "doomed").await.unwrap();
        let task = wait_for_status(&store, id, TaskStatus::DeadLetter, 5000).await;
        assert_eq!(task.attempt, 3);
        assert_eq!(task.last_error_code, Some(ErrorCode::Auth));

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_backpressure_at_exact_depth() {
        let config = EngineConfig {
            max_queue_depth: 3,
            workers: 0,
            ..fast_config()
        };
        let (engine, store, _bus) = engine_with(Arc::new(EchoProcessor), config).await;
        // No workers running: tasks stay queued.

        for n in 0..3 {
            engine
                .create_chat_task("session-1", &format!("msg-{n}"))
                .await
                .unwrap();
        }
        let err = engine.create_chat_task("session-1", "overflow").await;
        assert!(matches!(err, Err(CoreError::QueueSaturated { depth: 3, limit: 3, .. })));

        use crate::domain::ports::TaskStore as _;
        assert_eq!(store.queue_depth().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_abort_running_task_cancels_within_heartbeat() {
        let (engine, store, bus) = engine_with(Arc::new(BlockingProcessor), fast_config()).await;
        let mut events = bus.subscribe("task.").await;
        engine.start().await.unwrap();

        let id = engine.create_chat_task("session-1", "forever").await.unwrap();
        wait_for_status(&store, id, TaskStatus::Running, 3000).await;

        assert!(engine.abort_task(id).await.unwrap());
        wait_for_status(&store, id, TaskStatus::Canceled, 3000).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.topic, "task.canceled");

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_abort_queued_task() {
        let config = EngineConfig {
            workers: 0,
            ..fast_config()
        };
        let (engine, store, _bus) = engine_with(Arc::new(EchoProcessor), config).await;

        let id = engine.create_chat_task("session-1", "waiting").await.unwrap();
        assert!(engine.abort_task(id).await.unwrap());

        use crate::domain::ports::TaskStore as _;
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_stream_chat_task_delivers_chunks() {
        use crate::adapters::brains::{MockBrain, MockReply};
        use crate::services::chat_processor::ChatProcessor;

        let pool = create_migrated_test_pool().await.unwrap();
        let store = Arc::new(SqliteTaskStore::new(pool));
        let bus = Arc::new(EventBus::new());
        let brain = Arc::new(MockBrain::new());
        brain.push(MockReply {
            text: "streamed reply".to_string(),
            fail: false,
            error_message: None,
            chunk_size: 4,
        });
        let processor = Arc::new(ChatProcessor::new(store.clone(), brain));
        let engine = TaskEngine::new(
            store.clone(),
            processor,
            bus.clone(),
            EngineConfig {
                workers: 0,
                ..fast_config()
            },
        );

        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink = chunks.clone();
        let streamed = engine
            .stream_chat_task("session-1", "hi", move |chunk| {
                sink.lock().unwrap().push(chunk.to_string());
            })
            .await
            .unwrap();

        assert_eq!(streamed.reply, "streamed reply");
        assert_eq!(chunks.lock().unwrap().join(""), "streamed reply");

        use crate::domain::ports::TaskStore as _;
        let task = store.get_task(streamed.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (engine, _store, _bus) = engine_with(Arc::new(EchoProcessor), fast_config()).await;
        engine.start().await.unwrap();

        let status = engine.status();
        assert_eq!(status.worker_count, 2);
        assert_eq!(status.active_tasks, 0);
        assert!(status.agent_id.is_none());

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_drain_stops_claiming() {
        let (engine, store, _bus) = engine_with(Arc::new(EchoProcessor), fast_config()).await;
        engine.start().await.unwrap();
        engine.drain(Duration::from_millis(500)).await;

        // Tasks created after drain are never claimed.
        let id = engine.create_chat_task("session-1", "late").await.unwrap();
        sleep(Duration::from_millis(200)).await;

        use crate::domain::ports::TaskStore as _;
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[test]
    fn test_approx_tokens() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("abc"), 1);
        assert_eq!(approx_tokens("abcd"), 1);
        assert_eq!(approx_tokens("abcde"), 2);
    }
}
