//! # orca-llm
//!
//! Model backends behind one [`ModelBackend`] trait: a local Ollama server,
//! a hosted OpenAI-compatible API, and a scripted mock for tests. Each real
//! backend carries independent retry budgets for connection failures and for
//! a model that is still loading.

pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod retry;

pub use mock::MockBackend;
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;
pub use provider::ModelBackend;
pub use retry::RetryPolicy;

use std::sync::Arc;

use orca_config::BackendConfig;
use orca_core::{OrcaError, Result};

/// Build the backend named by `config.provider`.
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn ModelBackend>> {
    let policy = RetryPolicy::from_config(config);
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(
            OllamaBackend::new(&config.base_url, &config.model)
                .with_sampling(config.max_tokens, config.temperature)
                .with_policy(policy),
        )),
        "openai" => {
            let key = config.api_key.clone().unwrap_or_default();
            Ok(Arc::new(
                OpenAiBackend::new(key, &config.model)
                    .with_base_url(&config.base_url)
                    .with_sampling(config.max_tokens, config.temperature)
                    .with_policy(policy),
            ))
        }
        other => Err(OrcaError::Config(format!("unknown backend provider: {other}"))),
    }
}
