use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::provider::ModelBackend;
use crate::retry::{Attempt, RetryPolicy, until_loaded};
use orca_core::{OrcaError, Result};

/// Local model backend speaking the Ollama HTTP API.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    policy: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct Options {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    messages: Option<&'a [ChatMessage]>,
    stream: bool,
    options: Options,
}

/// What one response body (or one streamed line) said.
#[derive(Debug, PartialEq)]
enum Frame {
    Text(String),
    Loading,
    Done,
    Failed(String),
}

const ROLE_PREFIXES: [&str; 3] = ["system:", "user:", "assistant:"];

/// Split a flattened `role: content` prompt back into chat messages.
///
/// A line opening with `system:`, `user:` or `assistant:` starts a new message;
/// any other line continues the current one. Messages with no content (such as
/// the trailing `assistant:` cue) are dropped.
pub fn split_prompt(prompt: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let mut role: Option<&str> = None;
    let mut content = String::new();

    let mut flush = |role: Option<&str>, content: &mut String| {
        if let Some(r) = role {
            let text = content.trim();
            if !text.is_empty() {
                messages.push(ChatMessage {
                    role: r.to_string(),
                    content: text.to_string(),
                });
            }
        }
        content.clear();
    };

    for raw in prompt.lines() {
        let line = raw.trim();
        if line.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            continue;
        }
        if let Some(prefix) = ROLE_PREFIXES.iter().copied().find(|p| line.starts_with(p)) {
            flush(role, &mut content);
            role = Some(prefix.trim_end_matches(':'));
            content.push_str(line[prefix.len()..].trim());
        } else {
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(line);
        }
    }
    flush(role, &mut content);
    messages
}

/// Interpret one JSON object from either `/api/generate` or `/api/chat`.
fn read_frame(value: &Value) -> Frame {
    if let Some(err) = value.get("error").and_then(Value::as_str) {
        return Frame::Failed(err.to_string());
    }
    if value.get("done_reason").and_then(Value::as_str) == Some("load") {
        return Frame::Loading;
    }
    let text = value
        .get("response")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| value["message"]["content"].as_str());
    match text {
        Some(t) if !t.is_empty() => Frame::Text(t.to_string()),
        _ if value.get("done").and_then(Value::as_bool) == Some(true) => Frame::Done,
        _ => Frame::Text(String::new()),
    }
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            max_tokens: 1000,
            temperature: 0.7,
            policy: RetryPolicy::default(),
        }
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

    /// Role-structured prompts go to `/api/chat`, everything else to `/api/generate`.
    fn route(prompt: &str) -> Option<Vec<ChatMessage>> {
        if prompt.contains("user:") && prompt.contains("assistant:") {
            let messages = split_prompt(prompt);
            if !messages.is_empty() {
                return Some(messages);
            }
        }
        None
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let messages = Self::route(prompt);
        let (endpoint, body) = match &messages {
            Some(msgs) => (
                "api/chat",
                OllamaRequest {
                    model: &self.model,
                    prompt: None,
                    messages: Some(msgs.as_slice()),
                    stream,
                    options: self.options(),
                },
            ),
            None => (
                "api/generate",
                OllamaRequest {
                    model: &self.model,
                    prompt: Some(prompt),
                    messages: None,
                    stream,
                    options: self.options(),
                },
            ),
        };
        let url = format!("{}/{}", self.base_url, endpoint);
        debug!(%url, stream, "sending request to ollama");

        let resp = self
            .policy
            .send_with_retry(|| self.client.post(&url).json(&body).send())
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(OrcaError::Backend(format!("ollama returned {status}: {text}")));
        }
        Ok(resp)
    }

    fn options(&self) -> Options {
        Options {
            temperature: self.temperature,
            num_predict: self.max_tokens,
        }
    }

    async fn generate_once(&self, prompt: &str) -> Result<Attempt<String>> {
        let resp = self.send(prompt, false).await?;
        let body = resp
            .text()
            .await
            .map_err(|e| OrcaError::Backend(format!("reading ollama response: {e}")))?;

        match serde_json::from_str::<Value>(&body) {
            Ok(value) => match read_frame(&value) {
                Frame::Text(t) if !t.trim().is_empty() => Ok(Attempt::Ready(t)),
                Frame::Loading => Ok(Attempt::Loading),
                Frame::Failed(e) => Err(OrcaError::Backend(format!("ollama: {e}"))),
                _ => Err(OrcaError::EmptyResponse),
            },
            // Not JSON: some proxies hand back the bare completion.
            Err(_) if !body.trim().is_empty() => Ok(Attempt::Ready(body.trim().to_string())),
            Err(_) => Err(OrcaError::EmptyResponse),
        }
    }

    async fn stream_once(&self, prompt: &str, sink: &mpsc::Sender<String>) -> Result<Attempt<()>> {
        let resp = self.send(prompt, true).await?;
        let mut stream = resp.bytes_stream();
        // Raw bytes so a multi-byte character split across chunks stays intact.
        let mut buffer: Vec<u8> = Vec::new();
        let mut emitted = false;

        'read: loop {
            let next = stream.next().await;
            let at_end = next.is_none();
            match next {
                Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    return Err(OrcaError::Backend(format!("ollama stream interrupted: {e}")));
                }
                // Final line may lack a trailing newline.
                None => buffer.push(b'\n'),
            }

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<Value>(line) else {
                    warn!(%line, "unparseable ollama stream line");
                    continue;
                };
                match read_frame(&value) {
                    Frame::Loading if !emitted => return Ok(Attempt::Loading),
                    Frame::Loading => {
                        return Err(OrcaError::Backend("model reloaded mid-stream".into()));
                    }
                    Frame::Failed(e) => return Err(OrcaError::Backend(format!("ollama: {e}"))),
                    Frame::Text(t) => {
                        if !t.is_empty() {
                            sink.send(t).await.map_err(|_| OrcaError::Cancelled)?;
                            emitted = true;
                        }
                    }
                    Frame::Done => break 'read,
                }
                if value.get("done").and_then(Value::as_bool) == Some(true) {
                    break 'read;
                }
            }

            if at_end {
                break;
            }
        }

        if emitted {
            Ok(Attempt::Ready(()))
        } else {
            Err(OrcaError::EmptyResponse)
        }
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let text = self
            .policy
            .bounded(until_loaded(&self.policy, || self.generate_once(prompt)))
            .await?;
        info!(model = %self.model, chars = text.len(), "ollama generation complete");
        Ok(text)
    }

    async fn generate_stream(&self, prompt: &str, sink: mpsc::Sender<String>) -> Result<()> {
        self.policy
            .bounded(until_loaded(&self.policy, || self.stream_once(prompt, &sink)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            role: role.into(),
            content: content.into(),
        }
    }

    #[test]
    fn test_split_prompt_roles() {
        let prompt = "system: be nice\n\nuser: hi\n\nassistant: hello\n\nuser: add 1 and 2\n\nassistant: ";
        assert_eq!(
            split_prompt(prompt),
            vec![
                msg("system", "be nice"),
                msg("user", "hi"),
                msg("assistant", "hello"),
                msg("user", "add 1 and 2"),
            ]
        );
    }

    #[test]
    fn test_split_prompt_keeps_multiline_content() {
        let prompt = "user: line one\nline two\n\nassistant: ";
        assert_eq!(split_prompt(prompt), vec![msg("user", "line one\nline two")]);
    }

    #[test]
    fn test_route_raw_prompt_to_generate() {
        assert!(OllamaBackend::route("just complete this").is_none());
        assert!(OllamaBackend::route("user: hi\n\nassistant: ").is_some());
    }

    #[test]
    fn test_read_frame_variants() {
        assert_eq!(read_frame(&json!({"response": "hi", "done": false})), Frame::Text("hi".into()));
        assert_eq!(
            read_frame(&json!({"message": {"role": "assistant", "content": "yo"}})),
            Frame::Text("yo".into())
        );
        assert_eq!(read_frame(&json!({"done_reason": "load", "done": true})), Frame::Loading);
        assert_eq!(read_frame(&json!({"response": "", "done": true})), Frame::Done);
        assert_eq!(
            read_frame(&json!({"error": "model not found"})),
            Frame::Failed("model not found".into())
        );
    }
}
