//! Brain port: the LLM abstraction consumed by processors and the loop
//! runner. Implementations (providers, routing, fallback) live outside
//! the orchestration core.

use async_trait::async_trait;

use crate::domain::errors::CoreResult;
use crate::domain::ports::processor::ChunkSink;

/// Maps `(session, content)` to a reply or a stream of chunks.
#[async_trait]
pub trait Brain: Send + Sync {
    /// Implementation name, for status output and logs.
    fn name(&self) -> &'static str;

    /// Produce a full reply for the given session and content.
    async fn respond(&self, session_id: &str, content: &str) -> CoreResult<String>;

    /// Stream a reply chunk by chunk. `on_chunk` may cancel the stream by
    /// returning an error.
    async fn stream(
        &self,
        session_id: &str,
        content: &str,
        on_chunk: &mut ChunkSink<'_>,
    ) -> CoreResult<()>;
}
