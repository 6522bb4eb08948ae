use serde::{Deserialize, Serialize};
use std::fmt;

/// Orchestration phase reported by a thinking event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingStage {
    Analyzing,
    ToolCall,
    ToolResult,
    ToolError,
    Generating,
}

impl fmt::Display for ThinkingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThinkingStage::Analyzing => "analyzing",
            ThinkingStage::ToolCall => "tool_call",
            ThinkingStage::ToolResult => "tool_result",
            ThinkingStage::ToolError => "tool_error",
            ThinkingStage::Generating => "generating",
        };
        f.write_str(s)
    }
}

/// Events emitted during a streamed turn, in order:
/// `Meta`, `Thinking(analyzing)`, optional tool stages, `Thinking(generating)`,
/// one or more `Content`, then `Done` (or `Error`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Meta {
        conversation_id: String,
        agent_conversation_id: String,
    },
    Thinking {
        stage: ThinkingStage,
        message: String,
    },
    Content {
        delta: String,
    },
    Done,
    Error {
        message: String,
    },
}

impl StreamEvent {
    pub fn thinking(stage: ThinkingStage, message: impl Into<String>) -> Self {
        StreamEvent::Thinking {
            stage,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }
}
