//! Orchestration services.

pub mod chat_processor;
pub mod completion_waiter;
pub mod cron_scheduler;
pub mod event_bus;
pub mod loop_runner;
pub mod plan_executor;
pub mod task_engine;

pub use chat_processor::ChatProcessor;
pub use completion_waiter::{CompletionWaiter, TaskOutcome, WaitReport};
pub use cron_scheduler::CronScheduler;
pub use event_bus::{Event, EventBus, EventPayload, Subscription};
pub use loop_runner::{LoopResult, LoopRunner, LoopRunnerConfig};
pub use plan_executor::{PlanExecutor, PlanExecutorConfig};
pub use task_engine::{approx_tokens, EngineConfig, EngineStatus, StreamedChat, TaskEngine};
