//! Processor port: the work executed for each claimed task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::Task;

/// Per-chunk sink for streaming processors. Returning an error cancels
/// the stream.
pub type ChunkSink<'a> = dyn FnMut(&str) -> CoreResult<()> + Send + 'a;

/// Execution scope handed to the processor for one attempt.
///
/// The engine owns the deadline and the cancellation token; the processor
/// must return promptly once either fires.
#[derive(Debug, Clone)]
pub struct RunContext {
    cancellation: CancellationToken,
    deadline: DateTime<Utc>,
    /// Trace identifier propagated for observability; set at attempt start.
    pub run_id: String,
}

impl RunContext {
    pub fn new(cancellation: CancellationToken, deadline: DateTime<Utc>, run_id: String) -> Self {
        Self {
            cancellation,
            deadline,
            run_id,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn deadline_exceeded(&self) -> bool {
        Utc::now() >= self.deadline
    }

    /// Whether the scope has ended for any reason.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline_exceeded()
    }

    /// Error describing why the scope ended; Unknown reason maps to a
    /// generic cancellation.
    pub fn done_error(&self) -> CoreError {
        if self.deadline_exceeded() {
            CoreError::Processor("timeout exceeded".to_string())
        } else {
            CoreError::Cancelled("task context ended".to_string())
        }
    }
}

/// The unit of work the engine runs for each task attempt.
///
/// Implementations are free to block on I/O; the engine enforces the
/// deadline and cancellation through the [`RunContext`].
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process one task attempt, returning the opaque result string.
    async fn process(&self, ctx: &RunContext, task: &Task) -> CoreResult<String>;

    /// Streaming variant: deliver the reply chunk by chunk, returning the
    /// full reply. The default delegates to [`process`](Self::process) and
    /// emits the reply as one chunk.
    async fn process_streaming(
        &self,
        ctx: &RunContext,
        task: &Task,
        on_chunk: &mut ChunkSink<'_>,
    ) -> CoreResult<String> {
        let reply = self.process(ctx, task).await?;
        on_chunk(&reply)?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_context_deadline() {
        let token = CancellationToken::new();
        let ctx = RunContext::new(
            token.clone(),
            Utc::now() - chrono::Duration::seconds(1),
            "run-1".to_string(),
        );
        assert!(ctx.deadline_exceeded());
        assert!(ctx.is_done());
        assert!(matches!(ctx.done_error(), CoreError::Processor(_)));
    }

    #[test]
    fn test_run_context_cancellation() {
        let token = CancellationToken::new();
        let ctx = RunContext::new(
            token.clone(),
            Utc::now() + chrono::Duration::minutes(10),
            "run-2".to_string(),
        );
        assert!(!ctx.is_done());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.done_error(), CoreError::Cancelled(_)));
    }
}
