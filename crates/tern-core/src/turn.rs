//! Turn control.
//!
//! One task per in-flight turn: resolve session continuity, persist the
//! operator message, bind the working directory, drive the backend stream
//! through the normalizer, and finalize. Every terminal path converges
//! on the same cleanup so a conversation can never be left busy.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;

use crate::backend::{AgentBackend, BackendEvent, InvokeRequest, ResultEnvelope};
use crate::error::StopRequested;
use crate::events::{ConversationStatus, OrchestratorEvent};
use crate::gate::PermissionOutcome;
use crate::message::{Message, MessagePayload};
use crate::normalize::TurnNormalizer;
use crate::service::Shared;
use crate::session::TurnHandle;
use crate::store::{Conversation, ConversationPatch, MessageStore};
use crate::title::derive_title;
use crate::workspace::{BoundWorkspace, WorkspaceBinder};

/// System message persisted when a turn is stopped by the operator or
/// superseded by a new turn.
pub const STOPPED_MESSAGE: &str = "Turn stopped by user";

/// Runs one turn to completion and releases it.
pub(crate) async fn run_turn<B: AgentBackend>(
    shared: Arc<Shared<B>>,
    handle: TurnHandle,
    text: String,
) {
    let conversation_id = handle.conversation_id.clone();

    shared
        .events
        .send_important(OrchestratorEvent::Status {
            conversation_id: conversation_id.clone(),
            status: ConversationStatus::Busy,
        })
        .await;

    match drive_turn(&shared, &handle, &text).await {
        Ok(()) => {}
        Err(err) if err.downcast_ref::<StopRequested>().is_some() => {
            append_message(&shared, &conversation_id, Message::system(STOPPED_MESSAGE)).await;
        }
        Err(err) => {
            let message = format!("{err:#}");
            tracing::error!(conversation_id = %conversation_id, error = %message, "turn failed");
            append_message(&shared, &conversation_id, Message::error(message.clone())).await;
            shared
                .events
                .send_important(OrchestratorEvent::Status {
                    conversation_id: conversation_id.clone(),
                    status: ConversationStatus::Error { message },
                })
                .await;
        }
    }

    // Cleanup runs on every terminal path: release the registry slot,
    // reject outstanding permissions, flip back to ready.
    shared.registry.end_turn(&conversation_id, handle.turn_id);
    let rejected = shared.gate.cancel_conversation(&conversation_id);
    if rejected > 0 {
        tracing::debug!(
            conversation_id = %conversation_id,
            rejected,
            "rejected pending permissions on turn end"
        );
    }
    shared
        .events
        .send_important(OrchestratorEvent::Status {
            conversation_id: conversation_id.clone(),
            status: ConversationStatus::Ready,
        })
        .await;
    // Dropping the handle signals `begin_turn` waiters that cleanup is
    // complete.
    drop(handle);
}

async fn drive_turn<B: AgentBackend>(
    shared: &Arc<Shared<B>>,
    handle: &TurnHandle,
    text: &str,
) -> Result<()> {
    let cancel = handle.cancel_token();
    let conversation_id = handle.conversation_id.as_str();

    let (conversation, history) = shared
        .store
        .load(conversation_id)
        .context("load conversation")?;
    let first_turn = history.is_empty();

    let resume_token = resolve_resume_token(shared, &conversation)?;

    // The user message lands before the backend is invoked, so it
    // survives even an immediate backend failure.
    let user_message = Message::user(text);
    shared
        .store
        .append(conversation_id, &user_message)
        .context("append user message")?;
    shared
        .events
        .send_important(OrchestratorEvent::MessageAppended {
            conversation_id: conversation_id.to_string(),
            message: user_message,
        })
        .await;

    let bound = shared
        .binder
        .ensure_working_directory(&conversation)
        .context("bind working directory")?;
    record_workspace(shared, &conversation, &bound)?;

    let request = InvokeRequest {
        conversation_id: conversation_id.to_string(),
        agent_kind: conversation.agent_kind,
        prompt: text.to_string(),
        workdir: bound.path.clone(),
        model: conversation
            .settings
            .model
            .clone()
            .or_else(|| shared.config.model.clone()),
        permission_mode: conversation.settings.permission_mode,
        allowed_tools: conversation.settings.allowed_tools.clone(),
        resume_token: resume_token.clone(),
        cancel: cancel.clone(),
    };

    let mut stream = shared
        .backends
        .invoke(request)
        .await
        .map_err(anyhow::Error::new)?;
    let mut normalizer = TurnNormalizer::new(conversation_id, resume_token);

    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                shared.backends.interrupt(conversation_id).await;
                return Err(StopRequested.into());
            }
            item = stream.next() => item,
        };
        let Some(item) = item else { break };
        let event = item.map_err(anyhow::Error::new)?;

        if let BackendEvent::PermissionAsked {
            request_id,
            tool_name,
            input,
        } = event
        {
            let outcome = shared
                .gate
                .request(conversation_id, &tool_name, input, cancel, &shared.events)
                .await;
            if outcome == PermissionOutcome::Cancelled {
                // Best-effort deny so the backend can wind the tool call
                // down, then abandon the stream.
                let _ = shared
                    .backends
                    .respond_permission(conversation_id, &request_id, &outcome)
                    .await;
                shared.backends.interrupt(conversation_id).await;
                return Err(StopRequested.into());
            }
            shared
                .backends
                .respond_permission(conversation_id, &request_id, &outcome)
                .await
                .map_err(anyhow::Error::new)
                .context("deliver permission decision")?;
            continue;
        }

        let session_started = matches!(&event, BackendEvent::SessionStarted { .. });
        for message in normalizer.apply(event, &shared.events).await {
            shared
                .store
                .append(conversation_id, &message)
                .context("append message")?;
            shared
                .events
                .send_important(OrchestratorEvent::MessageAppended {
                    conversation_id: conversation_id.to_string(),
                    message,
                })
                .await;
        }
        if session_started
            && let Some(session_id) = normalizer.session_id()
        {
            shared
                .store
                .update_conversation(conversation_id, ConversationPatch::resume_token(session_id))
                .context("cache resume token")?;
        }
    }

    finalize(shared, &conversation, &normalizer, first_turn, &bound, text).await
}

/// Validates a cached resume token against the validity window. An expired
/// token is discarded so the turn behaves exactly like one started with no
/// token at all.
fn resolve_resume_token<B: AgentBackend>(
    shared: &Arc<Shared<B>>,
    conversation: &Conversation,
) -> Result<Option<String>> {
    let Some(token) = conversation.resume_token.clone() else {
        return Ok(None);
    };
    let max_age = shared.config.resume_token_max_age();
    let fresh = conversation
        .resume_token_created_at
        .is_some_and(|created| Utc::now() - created <= max_age);
    if fresh {
        return Ok(Some(token));
    }
    tracing::info!(
        conversation_id = %conversation.id,
        "resume token expired; starting a fresh session"
    );
    shared
        .store
        .update_conversation(&conversation.id, ConversationPatch::clear_resume_token())
        .context("discard expired resume token")?;
    Ok(None)
}

fn record_workspace<B: AgentBackend>(
    shared: &Arc<Shared<B>>,
    conversation: &Conversation,
    bound: &BoundWorkspace,
) -> Result<()> {
    let branch_changed = bound.branch.is_some() && bound.branch != conversation.branch;
    let path_changed = bound.branch.is_some()
        && conversation.worktree_path.as_deref() != Some(bound.path.as_path());
    if !branch_changed && !path_changed {
        return Ok(());
    }
    let patch = ConversationPatch {
        branch: bound.branch.clone(),
        worktree_path: Some(bound.path.clone()),
        ..ConversationPatch::default()
    };
    shared
        .store
        .update_conversation(&conversation.id, patch)
        .context("record workspace binding")?;
    Ok(())
}

async fn finalize<B: AgentBackend>(
    shared: &Arc<Shared<B>>,
    conversation: &Conversation,
    normalizer: &TurnNormalizer,
    first_turn: bool,
    bound: &BoundWorkspace,
    user_text: &str,
) -> Result<()> {
    let conversation_id = conversation.id.as_str();

    let streamed = normalizer.streamed_text();
    if !streamed.is_empty() {
        let message = Message::new(MessagePayload::Assistant {
            text: streamed.to_string(),
            usage: normalizer.turn_usage(),
        });
        shared
            .store
            .append(conversation_id, &message)
            .context("append assistant message")?;
        shared
            .events
            .send_important(OrchestratorEvent::MessageAppended {
                conversation_id: conversation_id.to_string(),
                message,
            })
            .await;
    }

    if let Some(result) = normalizer.result() {
        let message = Message::new(MessagePayload::System {
            text: format_turn_summary(result),
            usage: normalizer.turn_usage(),
        });
        shared
            .store
            .append(conversation_id, &message)
            .context("append turn summary")?;
        shared
            .events
            .send_important(OrchestratorEvent::MessageAppended {
                conversation_id: conversation_id.to_string(),
                message,
            })
            .await;
    }

    let title = (first_turn && conversation.title.is_none()).then(|| derive_title(user_text));

    let commit_subject = title
        .clone()
        .or_else(|| conversation.title.clone())
        .unwrap_or_else(|| conversation_id.to_string());
    match shared.binder.commit_changes(
        conversation,
        &bound.path,
        &format!("tern: {commit_subject}"),
    ) {
        Ok(paths) if !paths.is_empty() => {
            shared
                .events
                .send_important(OrchestratorEvent::FilesChanged {
                    conversation_id: conversation_id.to_string(),
                    paths,
                })
                .await;
        }
        Ok(_) => {}
        Err(err) => {
            // The turn itself succeeded; a commit failure is operator
            // noise, not a turn failure.
            tracing::warn!(conversation_id, error = %format!("{err:#}"), "auto-commit failed");
        }
    }

    let session_id = normalizer.session_id().map(ToString::to_string);
    let mut patch = ConversationPatch::default();
    if let Some(session_id) = &session_id {
        patch.resume_token = Some(Some(session_id.clone()));
        patch.resume_token_created_at = Some(Some(Utc::now()));
    }
    if let Some(title) = &title {
        patch.title = Some(title.clone());
    }
    shared
        .store
        .update_conversation(conversation_id, patch)
        .context("update conversation metadata")?;

    if session_id.is_some() || title.is_some() {
        shared
            .events
            .send_important(OrchestratorEvent::SessionUpdated {
                conversation_id: conversation_id.to_string(),
                resume_token: session_id,
                title,
            })
            .await;
    }

    Ok(())
}

fn format_turn_summary(result: &ResultEnvelope) -> String {
    let mut parts = Vec::new();
    if let Some(num_turns) = result.num_turns {
        parts.push(format!(
            "{num_turns} turn{}",
            if num_turns == 1 { "" } else { "s" }
        ));
    }
    if let Some(cost) = result.cost_usd {
        parts.push(format!("${cost:.4}"));
    }
    if let Some(duration_ms) = result.duration_ms {
        parts.push(format!("{:.1}s", duration_ms as f64 / 1000.0));
    }
    if parts.is_empty() {
        "Turn completed".to_string()
    } else {
        format!("Turn completed: {}", parts.join(" · "))
    }
}

/// Appends a message, emitting the notification. Store failures here are
/// logged rather than propagated: these run on paths that must still
/// reach cleanup.
async fn append_message<B: AgentBackend>(
    shared: &Arc<Shared<B>>,
    conversation_id: &str,
    message: Message,
) {
    if let Err(err) = shared.store.append(conversation_id, &message) {
        tracing::warn!(conversation_id, error = %format!("{err:#}"), "failed to append message");
        return;
    }
    shared
        .events
        .send_important(OrchestratorEvent::MessageAppended {
            conversation_id: conversation_id.to_string(),
            message,
        })
        .await;
}
