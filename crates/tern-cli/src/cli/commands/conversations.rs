//! Conversation command handlers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tern_core::backend::AgentKind;
use tern_core::config::Config;
use tern_core::message::{Message, MessagePayload};
use tern_core::store::{Conversation, JsonlStore, MessageStore};

pub fn list() -> Result<()> {
    let store = JsonlStore::open_default().context("open store")?;
    let conversations = store.list().context("list conversations")?;
    if conversations.is_empty() {
        println!("No conversations found.");
        return Ok(());
    }
    for conversation in conversations {
        let title = conversation
            .title
            .as_deref()
            .unwrap_or("(untitled)");
        println!(
            "{}  {}  {}  {}",
            conversation.id,
            conversation.agent_kind.id(),
            title,
            conversation.updated_at.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

pub fn show(id: &str) -> Result<()> {
    let store = JsonlStore::open_default().context("open store")?;
    let (conversation, messages) = store
        .load(id)
        .with_context(|| format!("load conversation '{id}'"))?;

    if let Some(title) = &conversation.title {
        println!("# {title}");
    }
    if messages.is_empty() {
        println!("Conversation '{id}' is empty.");
        return Ok(());
    }
    for message in &messages {
        println!("{}", format_message(message));
    }
    Ok(())
}

pub fn new(
    config: &Config,
    repo: &str,
    id: Option<String>,
    research: bool,
    worktree: bool,
) -> Result<()> {
    let store = JsonlStore::open_default().context("open store")?;

    let repo_path = PathBuf::from(repo);
    let repo_path = repo_path.canonicalize().unwrap_or(repo_path);
    let id = id.unwrap_or_else(|| {
        uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(12)
            .collect()
    });
    let kind = if research {
        AgentKind::Research
    } else {
        AgentKind::Agent
    };

    let mut conversation = Conversation::new(&id, repo_path, kind);
    conversation.settings.model = config.model.clone();
    conversation.settings.permission_mode = config.permission_mode;
    conversation.settings.use_worktree = worktree;

    store.create(conversation).context("create conversation")?;
    println!("{id}");
    Ok(())
}

fn format_message(message: &Message) -> String {
    let stamp = message.created_at.format("%H:%M:%S");
    match &message.payload {
        MessagePayload::User { text } => format!("[{stamp}] user: {text}"),
        MessagePayload::Assistant { text, .. } => format!("[{stamp}] assistant: {text}"),
        MessagePayload::System { text, .. } => format!("[{stamp}] system: {text}"),
        MessagePayload::ToolUse { name, call_id, .. } => {
            format!("[{stamp}] tool: {name} ({call_id})")
        }
        MessagePayload::ToolResult {
            call_id, is_error, ..
        } => {
            let status = if *is_error { "failed" } else { "ok" };
            format!("[{stamp}] tool result ({call_id}): {status}")
        }
        MessagePayload::Error { text } => format!("[{stamp}] error: {text}"),
        MessagePayload::ResearchProgress {
            phase,
            search_count,
        } => format!("[{stamp}] research: {phase:?} ({search_count} searches)"),
        MessagePayload::ResearchResult { text, sources } => {
            format!("[{stamp}] research result ({} sources):\n{text}", sources.len())
        }
    }
}
