//! Mock model backend for deterministic testing.
//!
//! Returns scripted replies without making any HTTP calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::provider::ModelBackend;
use orca_core::{OrcaError, Result};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Full text; streamed word by word.
    Text(String),
    /// Explicit stream chunks, sent in order.
    Chunks(Vec<String>),
    /// A backend failure.
    Error(String),
    /// Keeps streaming `chunk` until the receiver goes away.
    Endless(String),
}

/// A scripted backend. Each `generate` or `generate_stream` call consumes one reply.
///
/// # Example
/// ```
/// use orca_llm::mock::MockBackend;
/// let backend = MockBackend::new()
///     .with_response("Hello, world!");
/// ```
#[derive(Clone, Default)]
pub struct MockBackend {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    /// Every prompt received, in call order.
    prompts: Arc<Mutex<Vec<String>>>,
}

pub const EXHAUSTED_REPLY: &str = "(mock: no more queued responses)";

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a text reply.
    pub fn with_response(self, text: &str) -> Self {
        self.push(MockReply::Text(text.to_string()))
    }

    /// Queue a reply streamed as the given chunks.
    pub fn with_chunks(self, chunks: &[&str]) -> Self {
        self.push(MockReply::Chunks(chunks.iter().map(|c| c.to_string()).collect()))
    }

    /// Queue a backend error.
    pub fn with_error(self, error: &str) -> Self {
        self.push(MockReply::Error(error.to_string()))
    }

    /// Queue a stream that never finishes on its own.
    pub fn with_endless_stream(self, chunk: &str) -> Self {
        self.push(MockReply::Endless(chunk.to_string()))
    }

    fn push(self, reply: MockReply) -> Self {
        self.replies.lock().push_back(reply);
        self
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }

    fn next_reply(&self, prompt: &str) -> MockReply {
        self.prompts.lock().push(prompt.to_string());
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockReply::Text(EXHAUSTED_REPLY.to_string()))
    }
}

fn words(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        match self.next_reply(prompt) {
            MockReply::Text(text) => Ok(text),
            MockReply::Chunks(chunks) => Ok(chunks.concat()),
            MockReply::Endless(chunk) => Ok(chunk),
            MockReply::Error(e) => Err(OrcaError::Backend(e)),
        }
    }

    async fn generate_stream(&self, prompt: &str, sink: mpsc::Sender<String>) -> Result<()> {
        let chunks = match self.next_reply(prompt) {
            MockReply::Text(text) => words(&text),
            MockReply::Chunks(chunks) => chunks,
            MockReply::Error(e) => return Err(OrcaError::Backend(e)),
            MockReply::Endless(chunk) => loop {
                if sink.send(chunk.clone()).await.is_err() {
                    return Err(OrcaError::Cancelled);
                }
                tokio::task::yield_now().await;
            },
        };
        for chunk in chunks {
            sink.send(chunk).await.map_err(|_| OrcaError::Cancelled)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_in_order() {
        let backend = MockBackend::new().with_response("one").with_response("two");
        assert_eq!(backend.generate("a").await.unwrap(), "one");
        assert_eq!(backend.generate("b").await.unwrap(), "two");
        assert_eq!(backend.generate("c").await.unwrap(), EXHAUSTED_REPLY);
        assert_eq!(backend.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_error_reply() {
        let backend = MockBackend::new().with_error("boom");
        let err = backend.generate("x").await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_stream_splits_words() {
        let backend = MockBackend::new().with_response("hello big world");
        let (tx, mut rx) = mpsc::channel(8);
        backend.generate_stream("p", tx).await.unwrap();
        let mut got = Vec::new();
        while let Some(chunk) = rx.recv().await {
            got.push(chunk);
        }
        assert_eq!(got, vec!["hello ", "big ", "world"]);
    }

    #[tokio::test]
    async fn test_endless_stream_stops_when_receiver_drops() {
        let backend = MockBackend::new().with_endless_stream("tick");
        let (tx, mut rx) = mpsc::channel(2);
        let reader = tokio::spawn(async move {
            let first = rx.recv().await;
            drop(rx);
            first
        });
        let err = backend.generate_stream("p", tx).await.unwrap_err();
        assert!(matches!(err, OrcaError::Cancelled));
        assert_eq!(reader.await.unwrap().as_deref(), Some("tick"));
    }
}
