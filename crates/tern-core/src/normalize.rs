//! Event normalization.
//!
//! Folds the uniform backend event stream into persisted messages and UI
//! notifications. One normalizer exists per turn; it owns the streamed
//! text buffer and the usage envelopes consulted at finalization.

use serde_json::Value;

use crate::backend::{BackendEvent, ResultEnvelope};
use crate::events::{EventSender, OrchestratorEvent};
use crate::message::{Message, MessagePayload, TurnUsage};

/// Tool whose structured payload doubles as a live checklist in the UI.
pub const TODO_TOOL_NAME: &str = "todo_write";

/// Per-turn folding state.
pub struct TurnNormalizer {
    conversation_id: String,
    requested_resume: Option<String>,
    streamed_text: String,
    assistant_tokens: Option<(u64, u64)>,
    result: Option<ResultEnvelope>,
    session_id: Option<String>,
}

impl TurnNormalizer {
    pub fn new(conversation_id: impl Into<String>, requested_resume: Option<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            requested_resume,
            streamed_text: String::new(),
            assistant_tokens: None,
            result: None,
            session_id: None,
        }
    }

    /// Folds one backend event, forwarding deltas and status payloads to
    /// the UI channel. Returns the messages to persist, in order.
    pub async fn apply(&mut self, event: BackendEvent, events: &EventSender) -> Vec<Message> {
        match event {
            BackendEvent::SessionStarted { session_id } => {
                if let Some(requested) = &self.requested_resume
                    && *requested != session_id
                {
                    // Non-fatal: adopt the backend's session and treat the
                    // turn as fresh for cost/timestamp purposes.
                    tracing::warn!(
                        conversation_id = %self.conversation_id,
                        requested = %requested,
                        returned = %session_id,
                        "resume token mismatch; continuing with returned session"
                    );
                }
                self.session_id = Some(session_id);
                vec![Message::system("Session started")]
            }
            BackendEvent::AssistantText { text } => {
                if !text.is_empty() {
                    self.streamed_text.push_str(&text);
                    events.send_delta(OrchestratorEvent::AssistantDelta {
                        conversation_id: self.conversation_id.clone(),
                        text,
                    });
                }
                Vec::new()
            }
            BackendEvent::AssistantUsage {
                input_tokens,
                output_tokens,
            } => {
                self.assistant_tokens = Some((input_tokens, output_tokens));
                Vec::new()
            }
            BackendEvent::ToolUse {
                call_id,
                name,
                input,
            } => {
                if name == TODO_TOOL_NAME {
                    events
                        .send_important(OrchestratorEvent::TodoUpdate {
                            conversation_id: self.conversation_id.clone(),
                            items: todo_items(&input),
                        })
                        .await;
                }
                vec![Message::new(MessagePayload::ToolUse {
                    call_id,
                    name,
                    input,
                })]
            }
            BackendEvent::ToolResult {
                call_id,
                content,
                is_error,
            } => vec![Message::new(MessagePayload::ToolResult {
                call_id,
                content,
                is_error,
            })],
            BackendEvent::ResearchProgress {
                phase,
                search_count,
            } => vec![Message::new(MessagePayload::ResearchProgress {
                phase,
                search_count,
            })],
            BackendEvent::ResearchResult { text, sources } => {
                vec![Message::new(MessagePayload::ResearchResult {
                    text,
                    sources,
                })]
            }
            BackendEvent::Completed(envelope) => {
                if self.session_id.is_none()
                    && let Some(session_id) = &envelope.session_id
                {
                    self.session_id = Some(session_id.clone());
                }
                self.result = Some(envelope);
                Vec::new()
            }
            // Permission requests are routed through the gate by the turn
            // controller before normalization.
            BackendEvent::PermissionAsked { .. } => Vec::new(),
        }
    }

    /// Assistant text accumulated so far.
    pub fn streamed_text(&self) -> &str {
        &self.streamed_text
    }

    /// Resume token captured from init or result events.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Terminal result envelope, when one was observed.
    pub fn result(&self) -> Option<&ResultEnvelope> {
        self.result.as_ref()
    }

    /// Combined usage for the finished turn: token counts from the last
    /// assistant envelope, cost/duration/turn-count from the result
    /// envelope. `None` when neither was observed.
    pub fn turn_usage(&self) -> Option<TurnUsage> {
        if self.assistant_tokens.is_none() && self.result.is_none() {
            return None;
        }
        let (input_tokens, output_tokens) = self.assistant_tokens.unwrap_or((0, 0));
        Some(TurnUsage {
            input_tokens,
            output_tokens,
            cost_usd: self.result.as_ref().and_then(|r| r.cost_usd),
            duration_ms: self.result.as_ref().and_then(|r| r.duration_ms),
            num_turns: self.result.as_ref().and_then(|r| r.num_turns),
        })
    }
}

fn todo_items(input: &Value) -> Value {
    input.get("todos").cloned().unwrap_or_else(|| input.clone())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::time::{Duration, timeout};

    use crate::events::create_event_channel;

    use super::*;

    #[tokio::test]
    async fn test_session_started_yields_system_message() {
        let (tx, _rx) = create_event_channel();
        let sender = EventSender::new(tx);
        let mut normalizer = TurnNormalizer::new("c1", None);

        let messages = normalizer
            .apply(
                BackendEvent::SessionStarted {
                    session_id: "sess_1".to_string(),
                },
                &sender,
            )
            .await;

        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0].payload,
            MessagePayload::System { text, .. } if text == "Session started"
        ));
        assert_eq!(normalizer.session_id(), Some("sess_1"));
    }

    #[tokio::test]
    async fn test_resume_mismatch_adopts_returned_session() {
        let (tx, _rx) = create_event_channel();
        let sender = EventSender::new(tx);
        let mut normalizer = TurnNormalizer::new("c1", Some("sess_old".to_string()));

        normalizer
            .apply(
                BackendEvent::SessionStarted {
                    session_id: "sess_new".to_string(),
                },
                &sender,
            )
            .await;

        assert_eq!(normalizer.session_id(), Some("sess_new"));
    }

    #[tokio::test]
    async fn test_text_accumulates_and_forwards_delta() {
        let (tx, mut rx) = create_event_channel();
        let sender = EventSender::new(tx);
        let mut normalizer = TurnNormalizer::new("c1", None);

        for chunk in ["hi ", "there"] {
            let messages = normalizer
                .apply(
                    BackendEvent::AssistantText {
                        text: chunk.to_string(),
                    },
                    &sender,
                )
                .await;
            // Deltas are transient: no message is persisted.
            assert!(messages.is_empty());
        }
        assert_eq!(normalizer.streamed_text(), "hi there");

        let ev = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(
            &*ev,
            OrchestratorEvent::AssistantDelta { text, .. } if text == "hi "
        ));
    }

    #[tokio::test]
    async fn test_todo_tool_emits_checklist_and_message() {
        let (tx, mut rx) = create_event_channel();
        let sender = EventSender::new(tx);
        let mut normalizer = TurnNormalizer::new("c1", None);

        let input = json!({"todos": [{"text": "write tests", "done": false}]});
        let messages = normalizer
            .apply(
                BackendEvent::ToolUse {
                    call_id: "call_1".to_string(),
                    name: TODO_TOOL_NAME.to_string(),
                    input: input.clone(),
                },
                &sender,
            )
            .await;

        // Persisted like any tool use.
        assert!(matches!(
            &messages[0].payload,
            MessagePayload::ToolUse { name, .. } if name == TODO_TOOL_NAME
        ));
        // And surfaced as a live checklist.
        let ev = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(
            &*ev,
            OrchestratorEvent::TodoUpdate { items, .. } if items == &input["todos"]
        ));
    }

    #[tokio::test]
    async fn test_usage_combines_assistant_and_result_envelopes() {
        let (tx, _rx) = create_event_channel();
        let sender = EventSender::new(tx);
        let mut normalizer = TurnNormalizer::new("c1", None);

        assert!(normalizer.turn_usage().is_none());

        normalizer
            .apply(
                BackendEvent::AssistantUsage {
                    input_tokens: 100,
                    output_tokens: 20,
                },
                &sender,
            )
            .await;
        let usage = normalizer.turn_usage().unwrap();
        assert_eq!(usage.output_tokens, 20);
        assert!(usage.cost_usd.is_none());

        normalizer
            .apply(
                BackendEvent::Completed(ResultEnvelope {
                    session_id: Some("sess_2".to_string()),
                    cost_usd: Some(0.05),
                    duration_ms: Some(900),
                    num_turns: Some(2),
                    is_error: false,
                }),
                &sender,
            )
            .await;
        let usage = normalizer.turn_usage().unwrap();
        assert_eq!(usage.cost_usd, Some(0.05));
        assert_eq!(usage.num_turns, Some(2));
        // Session captured from the result when init never arrived.
        assert_eq!(normalizer.session_id(), Some("sess_2"));
    }
}
