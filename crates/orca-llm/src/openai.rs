use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::provider::ModelBackend;
use crate::retry::RetryPolicy;
use orca_core::{OrcaError, Result};

/// Hosted backend for any OpenAI-compatible chat completions API.
/// The flattened prompt is sent as a single user message.
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    policy: RetryPolicy,
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".into(),
            model: model.into(),
            max_tokens: 1000,
            temperature: 0.7,
            policy: RetryPolicy::default(),
        }
    }

    /// Use a custom base URL (Azure, vLLM, a local gateway, ...).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        if prompt.is_empty() {
            return Err(OrcaError::Validation("prompt cannot be empty".into()));
        }
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": stream,
        });
        let url = format!("{}/chat/completions", self.base_url);
        debug!(%url, stream, "sending request to hosted backend");

        let resp = self
            .policy
            .send_with_retry(|| {
                self.client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(&body)
                    .send()
            })
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(OrcaError::Backend(format!("openai returned {status}: {text}")));
        }
        Ok(resp)
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let resp = self.send(prompt, false).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| OrcaError::Backend(format!("malformed openai response: {e}")))?;
        if let Some(err) = value["error"]["message"].as_str() {
            return Err(OrcaError::Backend(format!("openai: {err}")));
        }
        match value["choices"][0]["message"]["content"].as_str() {
            Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
            _ => Err(OrcaError::EmptyResponse),
        }
    }

    async fn stream_completion(&self, prompt: &str, sink: &mpsc::Sender<String>) -> Result<()> {
        let resp = self.send(prompt, true).await?;
        let mut stream = resp.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut emitted = false;

        'read: while let Some(chunk) = stream.next().await {
            let bytes =
                chunk.map_err(|e| OrcaError::Backend(format!("openai stream interrupted: {e}")))?;
            buffer.extend_from_slice(&bytes);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'read;
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    warn!(%data, "unparseable openai stream event");
                    continue;
                };
                if let Some(err) = event["error"]["message"].as_str() {
                    return Err(OrcaError::Backend(format!("openai: {err}")));
                }
                if let Some(delta) = event["choices"][0]["delta"]["content"].as_str()
                    && !delta.is_empty()
                {
                    sink.send(delta.to_string())
                        .await
                        .map_err(|_| OrcaError::Cancelled)?;
                    emitted = true;
                }
            }
        }

        if emitted {
            Ok(())
        } else {
            Err(OrcaError::EmptyResponse)
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let text = self.policy.bounded(self.complete(prompt)).await?;
        info!(model = %self.model, chars = text.len(), "hosted generation complete");
        Ok(text)
    }

    async fn generate_stream(&self, prompt: &str, sink: mpsc::Sender<String>) -> Result<()> {
        self.policy.bounded(self.stream_completion(prompt, &sink)).await
    }
}
