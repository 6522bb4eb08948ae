use orca_core::{CapabilityInfo, Message};

use crate::extract::LEGACY_MARKERS;

/// Flatten the instruction and the most recent `limit` messages into a
/// `role: content` transcript ending with an open `assistant: ` turn.
///
/// An empty instruction omits the system line entirely.
pub fn build_prompt(instruction: &str, history: &[Message], limit: usize) -> String {
    let mut prompt = String::new();
    if !instruction.trim().is_empty() {
        prompt.push_str("system: ");
        prompt.push_str(instruction);
        prompt.push_str("\n\n");
    }
    let start = history.len().saturating_sub(limit);
    for msg in &history[start..] {
        prompt.push_str(msg.role.as_str());
        prompt.push_str(": ");
        prompt.push_str(&msg.content);
        prompt.push_str("\n\n");
    }
    prompt.push_str("assistant: ");
    prompt
}

/// The configured instruction followed, when any capability is registered,
/// by a catalogue of them and the call formats the engine understands.
pub fn system_instruction(base: &str, capabilities: &[CapabilityInfo]) -> String {
    if capabilities.is_empty() {
        return base.to_string();
    }
    let mut out = String::from(base.trim_end());
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str("You can use these tools:\n");
    for cap in capabilities {
        out.push_str(&format!("- {}: {}\n", cap.name, cap.description));
    }
    out.push_str(&format!(
        "\nTo use a tool, reply with only a JSON object such as \
         {{\"tool\": \"<name>\", \"params\": {{...}}}}. \
         A fenced block opening with ```tool:<name> whose body holds the parameters, \
         or a line starting with `{} <name> <parameters>`, also work. \
         Use at most one tool per reply. Otherwise answer directly.",
        LEGACY_MARKERS[0]
    ));
    out
}
