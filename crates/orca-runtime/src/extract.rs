//! Tool-call extraction from free-form model output.
//!
//! Three conventions are recognised, tried in this order:
//!
//! ## Structured
//! The whole reply is a single JSON object:
//! ```text
//! {"tool": "calculator", "params": {"operation": "add", "a": 10, "b": 5}}
//! ```
//!
//! ## Fenced block
//! A fence opening at the start of a line, tagged with the tool name:
//! ````text
//! ```tool:calculator
//! {"operation": "add", "a": 10, "b": 5}
//! ```
//! ````
//!
//! ## Legacy marker
//! A marker phrase opening a line, followed by the name and parameter text:
//! ```text
//! USE TOOL: calculator operation=add, a=10, b=5
//! ```
//!
//! Each format needs a structural anchor, so prose that merely mentions a
//! tool or a marker mid-sentence is not treated as a call.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use orca_core::{CallFormat, Params, ToolInvocation};

/// Marker phrases for the legacy format. The second is the historical
/// Chinese form still emitted by older prompts.
pub const LEGACY_MARKERS: [&str; 2] = ["USE TOOL:", "使用工具:"];

static FENCED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^[ \t]*```tool:[ \t]*([\w.\-]+)[ \t]*\r?$(.*?)```")
        .expect("fenced call pattern")
});

static LEGACY_RE: LazyLock<Regex> = LazyLock::new(|| {
    let markers = LEGACY_MARKERS
        .iter()
        .map(|m| regex::escape(m))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?ms)^[ \t]*(?:{markers})[ \t]*([\w.\-]+)(.*)\z"))
        .expect("legacy marker pattern")
});

/// Find the first tool call in `output`, or `None` if there is none.
pub fn extract_tool_call(output: &str) -> Option<ToolInvocation> {
    structured(output)
        .or_else(|| fenced(output))
        .or_else(|| legacy(output))
}

fn structured(output: &str) -> Option<ToolInvocation> {
    let value: Value = serde_json::from_str(output.trim()).ok()?;
    let obj = value.as_object()?;
    let name = obj.get("tool")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    let params = match obj.get("params")? {
        Value::Object(map) => map.clone(),
        Value::String(text) => parse_params(text),
        Value::Null => Params::new(),
        // Not a parameter map, so the object is not a call.
        _ => return None,
    };
    Some(ToolInvocation {
        name: name.to_string(),
        params,
        format: CallFormat::Structured,
    })
}

fn fenced(output: &str) -> Option<ToolInvocation> {
    let caps = FENCED_RE.captures(output)?;
    Some(ToolInvocation {
        name: caps[1].to_string(),
        params: parse_params(caps.get(2).map_or("", |m| m.as_str())),
        format: CallFormat::Fenced,
    })
}

fn legacy(output: &str) -> Option<ToolInvocation> {
    let caps = LEGACY_RE.captures(output)?;
    Some(ToolInvocation {
        name: caps[1].to_string(),
        params: parse_params(caps.get(2).map_or("", |m| m.as_str())),
        format: CallFormat::LegacyMarker,
    })
}

/// Parse parameter text: a JSON object if it is one, otherwise
/// `key=value` pairs separated by commas. Anything else yields no parameters.
pub fn parse_params(text: &str) -> Params {
    let text = text.trim();
    if text.is_empty() {
        return Params::new();
    }
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        return map;
    }
    text.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), Value::String(value.trim().to_string())))
        })
        .collect()
}
