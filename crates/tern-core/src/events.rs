//! Orchestrator events for UI delivery.
//!
//! The orchestrator emits events via async channels. Delivery is
//! fire-and-forget: consumers render status transitions, persisted messages
//! and streaming deltas; no acknowledgment flows back.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::message::Message;

/// Conversation status as seen by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Busy,
    Ready,
    Error { message: String },
}

/// Events emitted by the orchestrator during and around turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// Conversation status transition. Every turn ends with `Ready`
    /// regardless of outcome.
    Status {
        conversation_id: String,
        status: ConversationStatus,
    },

    /// A message was appended to the store.
    MessageAppended {
        conversation_id: String,
        message: Message,
    },

    /// Incremental assistant text (transient; not persisted).
    AssistantDelta {
        conversation_id: String,
        text: String,
    },

    /// A tool invocation awaits an operator decision.
    PermissionRequested {
        conversation_id: String,
        request_id: String,
        tool_name: String,
        input: Value,
    },

    /// Structured checklist payload from the todo tool, for live rendering.
    TodoUpdate {
        conversation_id: String,
        items: Value,
    },

    /// Conversation metadata changed (resume token, title).
    SessionUpdated {
        conversation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },

    /// Files were committed on the conversation's branch.
    FilesChanged {
        conversation_id: String,
        paths: Vec<String>,
    },
}

/// Channel-based event sender (async, bounded).
pub type OrchestratorEventTx = mpsc::Sender<Arc<OrchestratorEvent>>;

/// Channel-based event receiver (async, bounded).
pub type OrchestratorEventRx = mpsc::Receiver<Arc<OrchestratorEvent>>;

/// Default channel capacity for event streams.
///
/// Set higher (128) to accommodate best-effort delta sends without blocking.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Creates a bounded event channel with the default capacity.
pub fn create_event_channel() -> (OrchestratorEventTx, OrchestratorEventRx) {
    mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}

/// Event sender wrapper that provides best-effort and reliable send modes.
///
/// Use `send_delta()` for high-volume events (`AssistantDelta`) that can be
/// dropped if the consumer is slow. Use `send_important()` for events that
/// must be delivered (status transitions, persisted messages, permission
/// requests).
#[derive(Clone)]
pub struct EventSender {
    tx: OrchestratorEventTx,
}

impl EventSender {
    /// Creates a new `EventSender` wrapping the given channel sender.
    pub fn new(tx: OrchestratorEventTx) -> Self {
        Self { tx }
    }

    /// Best-effort send: never awaits, drops if channel is full.
    pub fn send_delta(&self, ev: OrchestratorEvent) {
        let _ = self.tx.try_send(Arc::new(ev));
    }

    /// Reliable send: awaits delivery.
    pub async fn send_important(&self, ev: OrchestratorEvent) {
        let _ = self.tx.send(Arc::new(ev)).await;
    }
}
