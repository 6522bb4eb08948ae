use async_trait::async_trait;
use tokio::sync::mpsc;

use orca_core::Result;

/// A text-generation strategy. The engine only ever talks to this trait.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Short provider name ("ollama", "openai", "mock").
    fn name(&self) -> &str;

    /// Model identifier sent to the provider.
    fn model(&self) -> &str;

    /// Single-shot generation.
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Streamed generation. Deltas are pushed into `sink`, which is owned by
    /// the call and therefore closed when it returns, on success or failure.
    async fn generate_stream(&self, prompt: &str, sink: mpsc::Sender<String>) -> Result<()>;
}
