//! Ports: interfaces between the orchestration core and its collaborators.

pub mod brain;
pub mod loop_store;
pub mod plan_store;
pub mod processor;
pub mod schedule_store;
pub mod task_store;

pub use brain::Brain;
pub use loop_store::LoopStore;
pub use plan_store::PlanStore;
pub use processor::{ChunkSink, Processor, RunContext};
pub use schedule_store::ScheduleStore;
pub use task_store::TaskStore;
