use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration, maps to `orca.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrcaConfig {
    pub agent: AgentConfig,
    pub backend: BackendConfig,
    pub memory: MemoryConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

// ── Agent ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Display name, used in logs.
    pub name: String,
    /// Instruction placed at the top of every prompt.
    pub system_prompt: String,
    /// How many of the most recent transcript messages go into a prompt.
    pub history_limit: usize,
    /// Capacity of the bounded channel between the backend and the relay.
    pub stream_buffer: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "orca".into(),
            system_prompt: "You are a helpful assistant. Use a tool when it is needed to answer accurately.".into(),
            history_limit: 10,
            stream_buffer: 100,
        }
    }
}

// ── Model backend ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// "ollama" (local) or "openai" (hosted, OpenAI-compatible).
    pub provider: String,
    pub base_url: String,
    pub model: String,
    /// Hosted backends only.
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Overall wall-clock bound for one backend call.
    pub timeout_secs: u64,
    /// Attempts for transient connection failures (exponential backoff).
    pub connect_retries: u32,
    /// First backoff delay; doubles on each further attempt.
    pub backoff_base_ms: u64,
    /// Extra attempts while the model reports it is still loading.
    pub load_retries: u32,
    /// Fixed delay between "still loading" retries.
    pub load_retry_delay_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".into(),
            base_url: "http://localhost:11434".into(),
            model: "llama3.1".into(),
            api_key: None,
            max_tokens: 1000,
            temperature: 0.7,
            timeout_secs: 180,
            connect_retries: 3,
            backoff_base_ms: 2000,
            load_retries: 3,
            load_retry_delay_ms: 5000,
        }
    }
}

// ── Memory ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// "flat" (one JSON file per conversation) or "indexed" (SQLite).
    pub backend: String,
    /// Directory for conversation files, or the directory holding the SQLite database.
    pub data_dir: PathBuf,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: "flat".into(),
            data_dir: PathBuf::from("./data/conversations"),
        }
    }
}

// ── Server ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".into(),
            cors: true,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

pub const PROVIDERS: &[&str] = &["ollama", "openai"];
pub const MEMORY_BACKENDS: &[&str] = &["flat", "indexed"];

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
        };
        write!(f, "{label}: {}: {}", self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, " ({h})")?;
        }
        Ok(())
    }
}

impl OrcaConfig {
    /// Validate the config and return the non-fatal warnings.
    /// Returns `Err` with all error messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Agent ───
        if self.agent.history_limit == 0 {
            warnings.push(ConfigWarning {
                field: "agent.history_limit".into(),
                message: "history_limit is 0, the model would never see the user turn".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 10".into()),
            });
        }
        if self.agent.stream_buffer == 0 {
            warnings.push(ConfigWarning {
                field: "agent.stream_buffer".into(),
                message: "stream_buffer must be at least 1".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 100".into()),
            });
        }

        // ── Backend ───
        if !PROVIDERS.contains(&self.backend.provider.as_str()) {
            warnings.push(ConfigWarning {
                field: "backend.provider".into(),
                message: format!("unknown provider '{}'", self.backend.provider),
                severity: WarningSeverity::Error,
                hint: Some(format!("Valid values: {}", PROVIDERS.join(", "))),
            });
        }
        if self.backend.model.trim().is_empty() {
            warnings.push(ConfigWarning {
                field: "backend.model".into(),
                message: "model is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 'llama3.1'".into()),
            });
        }
        if self.backend.timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "backend.timeout_secs".into(),
                message: "timeout_secs is 0, every call would time out".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 180".into()),
            });
        }
        if self.backend.connect_retries == 0 {
            warnings.push(ConfigWarning {
                field: "backend.connect_retries".into(),
                message: "connect_retries is 0, no request would be sent".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to at least 1".into()),
            });
        }
        if self.backend.provider == "openai"
            && self.backend.api_key.as_deref().is_none_or(str::is_empty)
        {
            warnings.push(ConfigWarning {
                field: "backend.api_key".into(),
                message: "hosted provider configured without an API key".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Set backend.api_key or OPENAI_API_KEY".into()),
            });
        }

        // ── Memory ───
        if !MEMORY_BACKENDS.contains(&self.memory.backend.as_str()) {
            warnings.push(ConfigWarning {
                field: "memory.backend".into(),
                message: format!("unknown memory backend '{}'", self.memory.backend),
                severity: WarningSeverity::Error,
                hint: Some(format!("Valid values: {}", MEMORY_BACKENDS.join(", "))),
            });
        }

        // ── Server ───
        if !self.server.listen.starts_with("127.0.0.1") && !self.server.listen.starts_with("localhost") {
            warnings.push(ConfigWarning {
                field: "server.listen".into(),
                message: format!("listening on {} exposes the API beyond this machine", self.server.listen),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| w.to_string())
            .collect();
        if !errors.is_empty() {
            return Err(errors.join("\n"));
        }

        Ok(warnings)
    }
}
