//! Orchestrator facade.
//!
//! Holds the process-wide shared state (session registry, permission
//! gate, store, binder, backend router), constructed once at service
//! start and handed by reference into turn tasks. Nothing here lives in
//! module-level globals.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::backend::AgentBackend;
use crate::config::Config;
use crate::events::{EventSender, OrchestratorEventRx, create_event_channel};
use crate::gate::{PermissionGate, PermissionResponse};
use crate::session::SessionRegistry;
use crate::store::{ConversationPatch, MessageStore};
use crate::turn;
use crate::workspace::WorkspaceBinder;

/// State shared between the facade and its turn tasks.
pub(crate) struct Shared<B: AgentBackend> {
    pub(crate) config: Config,
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) binder: Arc<dyn WorkspaceBinder>,
    pub(crate) backends: B,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) gate: PermissionGate,
    pub(crate) events: EventSender,
}

/// Drives conversational turns across interchangeable agent backends.
pub struct Orchestrator<B: AgentBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: AgentBackend> Orchestrator<B> {
    /// Builds the orchestrator and returns the UI event receiver alongside
    /// it.
    pub fn new(
        config: Config,
        store: Arc<dyn MessageStore>,
        binder: Arc<dyn WorkspaceBinder>,
        backends: B,
    ) -> (Self, OrchestratorEventRx) {
        let (tx, rx) = create_event_channel();
        let gate = PermissionGate::new(config.permission_timeout());
        let shared = Arc::new(Shared {
            config,
            store,
            binder,
            backends,
            registry: Arc::new(SessionRegistry::new()),
            gate,
            events: EventSender::new(tx),
        });
        (Self { shared }, rx)
    }

    /// Starts a turn for the conversation.
    ///
    /// A turn already in flight is cancelled first, its stop message
    /// persisted before the new turn's user message, then the new turn
    /// runs on its own task. Never queues, never rejects.
    ///
    /// # Errors
    /// Returns an error if the conversation does not exist.
    pub async fn start_turn(&self, conversation_id: &str, text: &str) -> Result<()> {
        self.shared
            .store
            .load(conversation_id)
            .context("start turn")?;

        let handle = self.shared.registry.begin_turn(conversation_id).await;
        let shared = Arc::clone(&self.shared);
        tokio::spawn(turn::run_turn(shared, handle, text.to_string()));
        Ok(())
    }

    /// Requests cancellation of the conversation's running turn.
    ///
    /// Idempotent; returns `false` when the conversation was idle.
    pub fn stop(&self, conversation_id: &str) -> bool {
        self.shared.registry.cancel(conversation_id)
    }

    /// Settles a pending permission request. Returns `false` when no
    /// matching request is pending.
    pub fn resolve_permission(&self, request_id: &str, response: PermissionResponse) -> bool {
        self.shared.gate.resolve(request_id, response)
    }

    /// Current resume token for the conversation: the backend's cached
    /// session when one is live, otherwise the stored one.
    pub fn resume_token(&self, conversation_id: &str) -> Option<String> {
        self.shared
            .backends
            .resume_token(conversation_id)
            .or_else(|| {
                self.shared
                    .store
                    .load(conversation_id)
                    .ok()
                    .and_then(|(conversation, _)| conversation.resume_token)
            })
    }

    /// Drops cached and stored session state so the next turn starts
    /// fresh.
    ///
    /// # Errors
    /// Returns an error if the stored token cannot be cleared.
    pub fn clear_session(&self, conversation_id: &str) -> Result<()> {
        self.shared.backends.clear_session(conversation_id);
        self.shared
            .store
            .update_conversation(conversation_id, ConversationPatch::clear_resume_token())
            .context("clear stored resume token")?;
        Ok(())
    }

    /// Returns true while a turn is in flight for the conversation.
    pub fn is_busy(&self, conversation_id: &str) -> bool {
        self.shared.registry.is_busy(conversation_id)
    }

    /// Number of in-flight turns across all conversations.
    pub fn active_turns(&self) -> usize {
        self.shared.registry.active_turns()
    }

    /// The underlying message store (conversation CRUD lives there).
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.shared.store
    }
}
