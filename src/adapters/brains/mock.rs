//! Mock brain for testing and demo mode.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::ports::processor::ChunkSink;
use crate::domain::ports::Brain;

/// A scripted reply.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub text: String,
    pub fail: bool,
    pub error_message: Option<String>,
    /// Chunk boundaries used by `stream`; the full text is split into
    /// pieces of this size.
    pub chunk_size: usize,
}

impl MockReply {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fail: false,
            error_message: None,
            chunk_size: 8,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            fail: true,
            error_message: Some(error.into()),
            chunk_size: 8,
        }
    }
}

/// Brain that pops scripted replies in order, falling back to echoing the
/// prompt when the script runs out.
pub struct MockBrain {
    script: Mutex<VecDeque<MockReply>>,
}

impl MockBrain {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a scripted reply.
    pub fn push(&self, reply: MockReply) {
        self.script.lock().expect("script lock").push_back(reply);
    }

    fn next_reply(&self, content: &str) -> MockReply {
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| MockReply::success(format!("echo: {content}")))
    }
}

impl Default for MockBrain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Brain for MockBrain {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn respond(&self, _session_id: &str, content: &str) -> CoreResult<String> {
        let reply = self.next_reply(content);
        if reply.fail {
            return Err(CoreError::Processor(
                reply
                    .error_message
                    .unwrap_or_else(|| "mock brain failure".to_string()),
            ));
        }
        Ok(reply.text)
    }

    async fn stream(
        &self,
        _session_id: &str,
        content: &str,
        on_chunk: &mut ChunkSink<'_>,
    ) -> CoreResult<()> {
        let reply = self.next_reply(content);
        if reply.fail {
            return Err(CoreError::Processor(
                reply
                    .error_message
                    .unwrap_or_else(|| "mock brain failure".to_string()),
            ));
        }

        let chunk_size = reply.chunk_size.max(1);
        let chars: Vec<char> = reply.text.chars().collect();
        for piece in chars.chunks(chunk_size) {
            let chunk: String = piece.iter().collect();
            on_chunk(&chunk)?;
        }
        Ok(())
    }
}
