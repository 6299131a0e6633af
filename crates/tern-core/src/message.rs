//! Conversation message types.
//!
//! This module defines the persisted message taxonomy. Messages are created
//! by the event normalizer as backend events arrive, appended once to the
//! message store, and never mutated afterwards. Streaming deltas shown live
//! in a UI are transient and are not represented here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single persisted message within a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    pub id: String,
    /// Creation timestamp (UTC).
    pub created_at: DateTime<Utc>,
    /// Kind-specific payload.
    #[serde(flatten)]
    pub payload: MessagePayload,
}

/// Kind-specific message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Operator input that started a turn.
    User { text: String },

    /// Final assistant text for a turn, with usage when a result envelope
    /// was observed.
    Assistant {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TurnUsage>,
    },

    /// Orchestrator-produced notice (session started, turn stopped, turn
    /// summary). Terminal summaries carry usage.
    System {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TurnUsage>,
    },

    /// The backend invoked a tool.
    ToolUse {
        call_id: String,
        name: String,
        input: Value,
    },

    /// Outcome of a tool invocation. `call_id` always pairs with a
    /// previously appended `ToolUse` in the same turn.
    ToolResult {
        call_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },

    /// A failure surfaced to the operator.
    Error { text: String },

    /// Progress marker from the research backend.
    ResearchProgress {
        phase: ResearchPhase,
        search_count: u32,
    },

    /// Final research summary with its sources.
    ResearchResult {
        text: String,
        sources: Vec<ResearchSource>,
    },
}

impl Message {
    /// Creates a message with a fresh id and the current timestamp.
    pub fn new(payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            payload,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessagePayload::User { text: text.into() })
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessagePayload::System {
            text: text.into(),
            usage: None,
        })
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(MessagePayload::Error { text: text.into() })
    }

    /// Returns the tool call id when this message is part of a tool exchange.
    pub fn call_id(&self) -> Option<&str> {
        match &self.payload {
            MessagePayload::ToolUse { call_id, .. }
            | MessagePayload::ToolResult { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

/// Phases of a research turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchPhase {
    Planning,
    Searching,
    Synthesizing,
}

/// A source cited by a research result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchSource {
    pub url: String,
    pub title: String,
}

/// Usage accounting for a completed turn.
///
/// Token counts come from the last assistant envelope; cost, duration and
/// turn count come from the terminal result envelope when one was observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_message_serializes_with_kind_tag() {
        let msg = Message::user("hello");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "user");
        assert_eq!(value["text"], "hello");
        assert!(value["id"].is_string());
    }

    #[test]
    fn test_tool_messages_pair_by_call_id() {
        let use_msg = Message::new(MessagePayload::ToolUse {
            call_id: "call_1".to_string(),
            name: "bash".to_string(),
            input: json!({"command": "ls"}),
        });
        let result_msg = Message::new(MessagePayload::ToolResult {
            call_id: "call_1".to_string(),
            content: "ok".to_string(),
            is_error: false,
        });
        assert_eq!(use_msg.call_id(), result_msg.call_id());
    }

    #[test]
    fn test_assistant_usage_roundtrip() {
        let msg = Message::new(MessagePayload::Assistant {
            text: "hi there".to_string(),
            usage: Some(TurnUsage {
                input_tokens: 12,
                output_tokens: 34,
                cost_usd: Some(0.0123),
                duration_ms: Some(4200),
                num_turns: Some(2),
            }),
        });
        let json_str = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json_str).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn test_usage_omits_absent_cost_fields() {
        let msg = Message::new(MessagePayload::Assistant {
            text: "hi".to_string(),
            usage: Some(TurnUsage::default()),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value["usage"].get("cost_usd").is_none());
        assert!(value["usage"].get("duration_ms").is_none());
    }
}
