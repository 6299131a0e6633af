//! Agent backend adapters.
//!
//! Each adapter translates a provider's native protocol into the shared
//! [`BackendEvent`] taxonomy. Adding a backend means implementing
//! [`AgentBackend`]; everything above the adapters (normalization, turn
//! control, permissions) is backend-agnostic.

pub mod agent_cli;
pub mod agent_sdk;
pub mod research;

use std::future::Future;
use std::path::PathBuf;

use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, PermissionMode};
use crate::error::BackendError;
use crate::gate::PermissionOutcome;
use crate::message::{ResearchPhase, ResearchSource};

pub use agent_cli::CliBackend;
pub use agent_sdk::SdkBackend;
pub use research::ResearchBackend;

/// Declared backend family of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// General coding agent (SDK streaming session or CLI subprocess).
    Agent,
    /// Web-search research agent.
    Research,
}

impl AgentKind {
    /// Returns the string identifier used in config files and the CLI.
    pub fn id(&self) -> &'static str {
        match self {
            AgentKind::Agent => "agent",
            AgentKind::Research => "research",
        }
    }

    /// Returns the `AgentKind` for a given id string.
    pub fn from_id(id: &str) -> Option<AgentKind> {
        match id.to_lowercase().as_str() {
            "agent" | "coding" => Some(AgentKind::Agent),
            "research" => Some(AgentKind::Research),
            _ => None,
        }
    }
}

/// One turn's worth of input for a backend adapter.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub conversation_id: String,
    pub agent_kind: AgentKind,
    /// Operator message text.
    pub prompt: String,
    /// Working directory bound to the conversation for this turn.
    pub workdir: PathBuf,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub allowed_tools: Vec<String>,
    /// Continue a previous backend session, when still valid.
    pub resume_token: Option<String>,
    /// Turn-scoped stop signal.
    pub cancel: CancellationToken,
}

/// Authoritative stats from a backend's terminal result event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultEnvelope {
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
    pub is_error: bool,
}

/// Uniform event taxonomy produced by every adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Backend session established; carries the resume token.
    SessionStarted { session_id: String },
    /// Incremental assistant text.
    AssistantText { text: String },
    /// Token counts from an assistant envelope.
    AssistantUsage {
        input_tokens: u64,
        output_tokens: u64,
    },
    /// The backend invoked a tool.
    ToolUse {
        call_id: String,
        name: String,
        input: Value,
    },
    /// Outcome of a tool invocation.
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
    /// The backend suspended awaiting an operator decision for a gated
    /// tool.
    PermissionAsked {
        request_id: String,
        tool_name: String,
        input: Value,
    },
    /// Research backend progress marker.
    ResearchProgress {
        phase: ResearchPhase,
        search_count: u32,
    },
    /// Research backend final summary.
    ResearchResult {
        text: String,
        sources: Vec<ResearchSource>,
    },
    /// Terminal result event with authoritative stats.
    Completed(ResultEnvelope),
}

/// Lazy, single-pass event sequence for one turn. Once consumed or
/// abandoned it cannot be replayed; a new turn starts a new stream.
pub type BackendStream = BoxStream<'static, Result<BackendEvent, BackendError>>;

/// A pluggable agent backend.
///
/// Futures are `Send` so turns can run on spawned tasks.
pub trait AgentBackend: Send + Sync + 'static {
    /// Starts one turn and returns its event stream.
    fn invoke(
        &self,
        request: InvokeRequest,
    ) -> impl Future<Output = Result<BackendStream, BackendError>> + Send;

    /// Delivers a permission decision for an outstanding
    /// [`BackendEvent::PermissionAsked`].
    fn respond_permission(
        &self,
        conversation_id: &str,
        request_id: &str,
        outcome: &PermissionOutcome,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Tells the backend to abandon the conversation's stream promptly.
    fn interrupt(&self, conversation_id: &str) -> impl Future<Output = ()> + Send;

    /// Cached resume token for the conversation, if the backend keeps
    /// sessions.
    fn resume_token(&self, conversation_id: &str) -> Option<String>;

    /// Drops any cached session state for the conversation.
    fn clear_session(&self, conversation_id: &str);
}

/// Router over the concrete adapters.
///
/// Holds no turn state of its own: selection is a pure function of the
/// request, and `interrupt`/`clear_session` fan out to whichever adapter
/// owns the conversation (no-ops elsewhere).
pub struct Backends {
    cli: CliBackend,
    sdk: Option<SdkBackend>,
    research: ResearchBackend,
}

impl Backends {
    /// Builds the adapter set from configuration. The SDK adapter is only
    /// constructed when an endpoint is configured.
    pub fn from_config(config: &Config) -> Self {
        Self {
            cli: CliBackend::new(config.agent.clone()),
            sdk: config
                .agent
                .endpoint
                .as_deref()
                .map(SdkBackend::new),
            research: ResearchBackend::new(config.research.clone()),
        }
    }
}

impl AgentBackend for Backends {
    async fn invoke(&self, request: InvokeRequest) -> Result<BackendStream, BackendError> {
        match request.agent_kind {
            AgentKind::Research => self.research.invoke(request).await,
            AgentKind::Agent => match &self.sdk {
                Some(sdk) => sdk.invoke(request).await,
                None => self.cli.invoke(request).await,
            },
        }
    }

    async fn respond_permission(
        &self,
        conversation_id: &str,
        request_id: &str,
        outcome: &PermissionOutcome,
    ) -> Result<(), BackendError> {
        if let Some(sdk) = &self.sdk
            && sdk.owns(conversation_id)
        {
            return sdk
                .respond_permission(conversation_id, request_id, outcome)
                .await;
        }
        self.cli
            .respond_permission(conversation_id, request_id, outcome)
            .await
    }

    async fn interrupt(&self, conversation_id: &str) {
        self.cli.interrupt(conversation_id).await;
        if let Some(sdk) = &self.sdk {
            sdk.interrupt(conversation_id).await;
        }
        self.research.interrupt(conversation_id).await;
    }

    fn resume_token(&self, conversation_id: &str) -> Option<String> {
        if let Some(sdk) = &self.sdk
            && let Some(token) = sdk.resume_token(conversation_id)
        {
            return Some(token);
        }
        // The research backend is stateless; only the coding adapters keep
        // sessions.
        self.cli.resume_token(conversation_id)
    }

    fn clear_session(&self, conversation_id: &str) {
        self.cli.clear_session(conversation_id);
        if let Some(sdk) = &self.sdk {
            sdk.clear_session(conversation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_kind_ids_roundtrip() {
        assert_eq!(AgentKind::from_id("agent"), Some(AgentKind::Agent));
        assert_eq!(AgentKind::from_id("coding"), Some(AgentKind::Agent));
        assert_eq!(AgentKind::from_id("Research"), Some(AgentKind::Research));
        assert_eq!(AgentKind::from_id("unknown"), None);
        assert_eq!(AgentKind::Research.id(), "research");
    }

    #[test]
    fn test_agent_kind_serde_format() {
        let value = serde_json::to_value(AgentKind::Research).unwrap();
        assert_eq!(value, "research");
    }
}
