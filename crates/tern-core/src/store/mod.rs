//! Conversation persistence.
//!
//! The orchestrator reads and patches conversations but never owns their
//! persistence: everything flows through the [`MessageStore`] trait. Two
//! implementations ship: a JSONL-backed file store and an in-memory store
//! for tests and embedding.

pub mod jsonl;
pub mod memory;

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::AgentKind;
use crate::config::PermissionMode;
use crate::message::Message;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

/// Per-conversation settings forwarded to backends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSettings {
    /// Model override; falls back to the service default.
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    /// Tools pre-approved for this conversation.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    /// Bind the conversation to an isolated git worktree.
    pub use_worktree: bool,
}

/// Conversation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub agent_id: String,
    pub repo_path: PathBuf,
    pub agent_kind: AgentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token_created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub settings: ConversationSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Creates a conversation with fresh timestamps.
    pub fn new(id: impl Into<String>, repo_path: PathBuf, agent_kind: AgentKind) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            agent_id: id.clone(),
            id,
            repo_path,
            agent_kind,
            resume_token: None,
            resume_token_created_at: None,
            branch: None,
            worktree_path: None,
            title: None,
            settings: ConversationSettings::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial conversation update.
///
/// `None` leaves a field untouched; for the nullable fields, `Some(None)`
/// clears the stored value.
#[derive(Debug, Clone, Default)]
pub struct ConversationPatch {
    pub resume_token: Option<Option<String>>,
    pub resume_token_created_at: Option<Option<DateTime<Utc>>>,
    pub title: Option<String>,
    pub branch: Option<String>,
    pub worktree_path: Option<PathBuf>,
}

impl ConversationPatch {
    /// Patch that caches a freshly issued resume token.
    pub fn resume_token(token: impl Into<String>) -> Self {
        Self {
            resume_token: Some(Some(token.into())),
            resume_token_created_at: Some(Some(Utc::now())),
            ..Self::default()
        }
    }

    /// Patch that discards the cached resume token.
    pub fn clear_resume_token() -> Self {
        Self {
            resume_token: Some(None),
            resume_token_created_at: Some(None),
            ..Self::default()
        }
    }

    /// Patch that sets the conversation title.
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// Applies the patch and refreshes `updated_at`.
    pub fn apply(self, conversation: &mut Conversation) {
        if let Some(token) = self.resume_token {
            conversation.resume_token = token;
        }
        if let Some(created) = self.resume_token_created_at {
            conversation.resume_token_created_at = created;
        }
        if let Some(title) = self.title {
            conversation.title = Some(title);
        }
        if let Some(branch) = self.branch {
            conversation.branch = Some(branch);
        }
        if let Some(path) = self.worktree_path {
            conversation.worktree_path = Some(path);
        }
        conversation.updated_at = Utc::now();
    }
}

/// Append-only per-conversation log plus conversation metadata.
///
/// Messages are persisted in the order they are appended; a read after an
/// append observes the new message.
pub trait MessageStore: Send + Sync {
    /// Creates a conversation. Fails if the id already exists.
    ///
    /// # Errors
    /// Returns an error if the conversation already exists or cannot be
    /// written.
    fn create(&self, conversation: Conversation) -> Result<()>;

    /// Appends one message to a conversation's log.
    ///
    /// # Errors
    /// Returns an error if the conversation does not exist or the write
    /// fails.
    fn append(&self, conversation_id: &str, message: &Message) -> Result<()>;

    /// Patches conversation metadata and returns the updated record.
    ///
    /// # Errors
    /// Returns an error if the conversation does not exist or the write
    /// fails.
    fn update_conversation(
        &self,
        conversation_id: &str,
        patch: ConversationPatch,
    ) -> Result<Conversation>;

    /// Loads a conversation and its messages in append order.
    ///
    /// # Errors
    /// Returns an error if the conversation does not exist or cannot be
    /// read.
    fn load(&self, conversation_id: &str) -> Result<(Conversation, Vec<Message>)>;

    /// Lists conversations, most recently updated first.
    ///
    /// # Errors
    /// Returns an error if the store cannot be enumerated.
    fn list(&self) -> Result<Vec<Conversation>>;
}
