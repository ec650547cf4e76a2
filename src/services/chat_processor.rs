//! Chat processor: the default `Processor` implementation.
//!
//! Decodes the persisted chat envelope, asks the brain for a reply, and
//! appends the assistant turn to session history. The user turn was
//! already recorded by the engine's intake path.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{ChatPayload, Role, Task};
use crate::domain::ports::processor::ChunkSink;
use crate::domain::ports::{Brain, Processor, RunContext, TaskStore};
use crate::services::task_engine::approx_tokens;

pub struct ChatProcessor {
    store: Arc<dyn TaskStore>,
    brain: Arc<dyn Brain>,
}

impl ChatProcessor {
    pub fn new(store: Arc<dyn TaskStore>, brain: Arc<dyn Brain>) -> Self {
        Self { store, brain }
    }

    async fn record_reply(&self, task: &Task, reply: &str) -> CoreResult<()> {
        self.store
            .add_history(
                &task.session_id,
                task.agent_id.as_deref(),
                Role::Assistant,
                reply,
                approx_tokens(reply),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Processor for ChatProcessor {
    async fn process(&self, ctx: &RunContext, task: &Task) -> CoreResult<String> {
        let payload = ChatPayload::decode(&task.payload)?;
        if ctx.is_done() {
            return Err(ctx.done_error());
        }

        let reply = self.brain.respond(&task.session_id, &payload.content).await?;
        if ctx.is_done() {
            return Err(ctx.done_error());
        }

        self.record_reply(task, &reply).await?;
        Ok(reply)
    }

    async fn process_streaming(
        &self,
        ctx: &RunContext,
        task: &Task,
        on_chunk: &mut ChunkSink<'_>,
    ) -> CoreResult<String> {
        let payload = ChatPayload::decode(&task.payload)?;
        if ctx.is_done() {
            return Err(ctx.done_error());
        }

        let mut reply = String::new();
        {
            let cancellation = ctx.cancellation().clone();
            let mut sink = |chunk: &str| -> CoreResult<()> {
                if cancellation.is_cancelled() {
                    return Err(CoreError::Cancelled("stream cancelled".to_string()));
                }
                reply.push_str(chunk);
                on_chunk(chunk)
            };
            self.brain
                .stream(&task.session_id, &payload.content, &mut sink)
                .await?;
        }

        self.record_reply(task, &reply).await?;
        Ok(reply)
    }
}
