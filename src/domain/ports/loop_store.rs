//! Loop checkpoint store port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::CoreResult;
use crate::domain::models::LoopCheckpoint;

/// Repository interface for loop runner checkpoints.
#[async_trait]
pub trait LoopStore: Send + Sync {
    /// Upsert a checkpoint by loop id.
    async fn save_loop_checkpoint(&self, checkpoint: &LoopCheckpoint) -> CoreResult<()>;

    /// The resumable (`running`) checkpoint for a task, if any.
    async fn load_loop_checkpoint(&self, task_id: Uuid) -> CoreResult<Option<LoopCheckpoint>>;
}
