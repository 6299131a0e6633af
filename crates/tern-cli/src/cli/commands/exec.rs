//! Exec command: drive one turn and print the stream.

use std::io::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use tern_core::backend::agent_cli::binary_available;
use tern_core::backend::{AgentKind, Backends};
use tern_core::config::Config;
use tern_core::events::{ConversationStatus, OrchestratorEvent};
use tern_core::gate::PermissionResponse;
use tern_core::message::MessagePayload;
use tern_core::service::Orchestrator;
use tern_core::store::{JsonlStore, MessageStore};
use tern_core::workspace::{GitBinder, WorkspaceBinder};

pub async fn run(
    config: &Config,
    conversation_id: &str,
    prompt: &str,
    deny_tools: bool,
) -> Result<()> {
    let store: Arc<dyn MessageStore> = Arc::new(JsonlStore::open_default().context("open store")?);

    // Fail fast on an unusable subprocess setup instead of surfacing the
    // spawn error mid-turn.
    let (conversation, _) = store
        .load(conversation_id)
        .with_context(|| format!("load conversation '{conversation_id}'"))?;
    if conversation.agent_kind == AgentKind::Agent
        && config.agent.endpoint.is_none()
        && !binary_available(&config.agent.binary)
    {
        anyhow::bail!(
            "Agent binary '{}' not found in PATH; configure [agent] binary or endpoint",
            config.agent.binary
        );
    }

    let binder: Arc<dyn WorkspaceBinder> = Arc::new(GitBinder::new());
    let backends = Backends::from_config(config);
    let (orchestrator, mut rx) = Orchestrator::new(config.clone(), store, binder, backends);

    orchestrator
        .start_turn(conversation_id, prompt)
        .await
        .context("start turn")?;

    let mut streamed = false;
    while let Some(event) = rx.recv().await {
        match &*event {
            OrchestratorEvent::AssistantDelta { text, .. } => {
                streamed = true;
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            OrchestratorEvent::MessageAppended { message, .. } => match &message.payload {
                MessagePayload::ToolUse { name, .. } => println!("[tool] {name}"),
                MessagePayload::ToolResult { is_error: true, .. } => println!("[tool] failed"),
                MessagePayload::System { text, .. } => println!("[{text}]"),
                MessagePayload::ResearchResult { text, .. } => println!("{text}"),
                MessagePayload::Error { text } => eprintln!("error: {text}"),
                _ => {}
            },
            OrchestratorEvent::PermissionRequested {
                request_id,
                tool_name,
                input,
                ..
            } => {
                let response = if deny_tools {
                    PermissionResponse::deny("Denied by --deny-tools")
                } else {
                    ask_operator(tool_name, input)
                };
                orchestrator.resolve_permission(request_id, response);
            }
            OrchestratorEvent::FilesChanged { paths, .. } => {
                println!("[committed {} file(s)]", paths.len());
            }
            OrchestratorEvent::Status { status, .. } => match status {
                ConversationStatus::Ready => break,
                ConversationStatus::Error { message } => eprintln!("error: {message}"),
                ConversationStatus::Busy => {}
            },
            _ => {}
        }
    }

    if streamed {
        println!();
    }
    Ok(())
}

/// Blocking y/N prompt on stdin. The turn stays suspended at the gate
/// while the operator decides.
fn ask_operator(tool_name: &str, input: &serde_json::Value) -> PermissionResponse {
    println!("\n[permission] {tool_name} wants to run:");
    println!("{}", serde_json::to_string_pretty(input).unwrap_or_default());
    print!("approve? [y/N] ");
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return PermissionResponse::deny("Failed to read operator input");
    }
    if line.trim().eq_ignore_ascii_case("y") {
        PermissionResponse::approve()
    } else {
        PermissionResponse::deny("Denied by user")
    }
}
