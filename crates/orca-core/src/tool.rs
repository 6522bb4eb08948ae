use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Parameters handed to a capability: string keys, scalar or JSON values.
pub type Params = serde_json::Map<String, Value>;

/// A named callable unit the engine can invoke on the model's behalf.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Unique name the model uses to address this capability.
    fn name(&self) -> &str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str;

    /// Run the capability. Failures should be `OrcaError::Execution` or
    /// `OrcaError::Validation`; the engine turns them into text.
    async fn execute(&self, params: &Params) -> crate::Result<Value>;
}

/// Which textual convention the model used to request a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallFormat {
    /// A bare JSON object with `tool` and `params` fields.
    Structured,
    /// A fenced block opened with `tool:<name>`.
    Fenced,
    /// A marker phrase at the start of a line.
    LegacyMarker,
}

impl fmt::Display for CallFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallFormat::Structured => "structured",
            CallFormat::Fenced => "fenced",
            CallFormat::LegacyMarker => "legacy_marker",
        };
        f.write_str(s)
    }
}

/// A tool call extracted from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub params: Params,
    pub format: CallFormat,
}

/// Summary of a registered capability, used when describing tools to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub description: String,
}

/// Render a capability's success value the way it is injected into context.
/// Strings are used verbatim; anything else is compact JSON.
pub fn render_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
