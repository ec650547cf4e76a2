//! Shared fixtures for integration tests.

use std::sync::Arc;
use std::time::Duration;

use claw::adapters::brains::MockBrain;
use claw::adapters::sqlite::{
    create_migrated_test_pool, SqlitePlanStore, SqliteScheduleStore, SqliteTaskStore,
};
use claw::services::{
    ChatProcessor, CompletionWaiter, EngineConfig, EventBus, PlanExecutor, PlanExecutorConfig,
    TaskEngine,
};

/// Everything an end-to-end test needs, wired over one in-memory store.
pub struct Harness {
    pub tasks: Arc<SqliteTaskStore>,
    pub plans: Arc<SqlitePlanStore>,
    pub schedules: Arc<SqliteScheduleStore>,
    pub bus: Arc<EventBus>,
    pub brain: Arc<MockBrain>,
    pub waiter: Arc<CompletionWaiter>,
    engines: Vec<Arc<TaskEngine>>,
}

impl Harness {
    pub async fn new() -> Self {
        let pool = create_migrated_test_pool().await.expect("test pool");
        let tasks = Arc::new(
            SqliteTaskStore::new(pool.clone()).with_retry_backoff(Duration::from_millis(1)),
        );
        let plans = Arc::new(SqlitePlanStore::new(pool.clone()));
        let schedules = Arc::new(SqliteScheduleStore::new(pool));
        let bus = Arc::new(EventBus::new());
        let brain = Arc::new(MockBrain::new());
        let waiter = Arc::new(CompletionWaiter::new(tasks.clone(), Some(bus.clone())));
        Self {
            tasks,
            plans,
            schedules,
            bus,
            brain,
            waiter,
            engines: Vec::new(),
        }
    }

    /// Fast polling/heartbeat engine config for tests.
    pub fn engine_config(agent_id: Option<&str>) -> EngineConfig {
        EngineConfig {
            agent_id: agent_id.map(ToString::to_string),
            workers: 2,
            poll_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(50),
            task_timeout: Duration::from_secs(10),
            ..EngineConfig::default()
        }
    }

    fn build_engine(&self, config: EngineConfig) -> Arc<TaskEngine> {
        let processor = Arc::new(ChatProcessor::new(self.tasks.clone(), self.brain.clone()));
        Arc::new(TaskEngine::new(
            self.tasks.clone(),
            processor,
            self.bus.clone(),
            config,
        ))
    }

    /// Build and start an engine claiming for the given scope.
    pub async fn start_engine(&mut self, config: EngineConfig) -> Arc<TaskEngine> {
        let engine = self.build_engine(config);
        engine.start().await.expect("engine start");
        self.engines.push(engine.clone());
        engine
    }

    /// An engine used only for task intake (no workers).
    pub fn intake_engine(&self) -> Arc<TaskEngine> {
        self.build_engine(EngineConfig {
            workers: 0,
            ..Self::engine_config(None)
        })
    }

    /// Plan executor with worker pools for every named agent.
    pub async fn plan_executor(
        &mut self,
        agents: &[&str],
        max_attempts: u32,
        config: PlanExecutorConfig,
    ) -> PlanExecutor {
        for agent in agents {
            let engine_config = EngineConfig {
                max_attempts,
                ..Self::engine_config(Some(agent))
            };
            self.start_engine(engine_config).await;
        }
        PlanExecutor::new(
            self.plans.clone(),
            self.intake_engine(),
            self.waiter.clone(),
            self.bus.clone(),
            config,
        )
    }

    pub fn shutdown(&self) {
        for engine in &self.engines {
            engine.shutdown();
        }
    }
}
