use console::style;

use orca_config::OrcaConfig;
use orca_core::Role;
use orca_memory::Conversation;

const PREVIEW_CHARS: usize = 40;

pub(super) async fn cmd_conversations(config: &OrcaConfig, limit: usize) -> anyhow::Result<()> {
    let store = orca_memory::open_store(&config.memory.backend, &config.memory.data_dir).await?;
    let conversations = store.list_conversations(limit).await?;

    if conversations.is_empty() {
        println!("No conversations stored in {}", config.memory.data_dir.display());
        return Ok(());
    }

    for c in &conversations {
        println!(
            "{}  {}  {:>3} msgs  {}",
            style(&c.id).cyan(),
            style(c.updated_at.format("%Y-%m-%d %H:%M")).dim(),
            c.messages.len(),
            preview(c),
        );
    }
    Ok(())
}

/// The opening user message, shortened for a one-line listing.
fn preview(conversation: &Conversation) -> String {
    let Some(first) = conversation.messages.iter().find(|m| m.role == Role::User) else {
        return conversation.title.clone();
    };
    let line = first.content.lines().next().unwrap_or_default();
    if line.chars().count() > PREVIEW_CHARS {
        let head: String = line.chars().take(PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        line.to_string()
    }
}
