//! SDK streaming session adapter.
//!
//! Talks to an agent server: one POST per turn, answered with an SSE event
//! stream. Permission decisions and interrupts go back over plain HTTP
//! against the session captured from the stream's init event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::BackendError;
use crate::gate::PermissionOutcome;
use crate::message::ResearchSource;

use super::{BackendEvent, BackendStream, InvokeRequest, ResultEnvelope};

/// HTTP/SSE coding-agent adapter.
pub struct SdkBackend {
    endpoint: String,
    http: reqwest::Client,
    sessions: Arc<Mutex<HashMap<String, String>>>,
}

impl SdkBackend {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns true when this adapter holds a session for the conversation.
    pub fn owns(&self, conversation_id: &str) -> bool {
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .contains_key(conversation_id)
    }

    /// Starts one turn and returns its SSE-backed event stream.
    ///
    /// # Errors
    /// Returns a configuration error for a malformed endpoint, a transport
    /// error for connection or HTTP-status failures.
    pub async fn invoke(&self, request: InvokeRequest) -> Result<BackendStream, BackendError> {
        let url = format!("{}/v1/turns", self.endpoint);
        url::Url::parse(&url).map_err(|err| {
            BackendError::config(format!("Invalid agent endpoint '{}': {err}", self.endpoint))
        })?;

        let body = json!({
            "conversation_id": request.conversation_id,
            "prompt": request.prompt,
            "model": request.model,
            "permission_mode": request.permission_mode.id(),
            "allowed_tools": request.allowed_tools,
            "session_id": request.resume_token,
            "workdir": request.workdir,
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| BackendError::transport(format!("Agent server request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::http_status(status.as_u16(), &body));
        }

        let sessions = Arc::clone(&self.sessions);
        let conversation_id = request.conversation_id;
        let stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(move |item| {
                let sessions = Arc::clone(&sessions);
                let conversation_id = conversation_id.clone();
                async move {
                    match item {
                        Ok(event) => {
                            let mapped = map_sse_event(&event.event, &event.data);
                            if let Some(Ok(BackendEvent::SessionStarted { session_id })) = &mapped {
                                let mut sessions =
                                    sessions.lock().expect("sessions lock poisoned");
                                sessions.insert(conversation_id, session_id.clone());
                            }
                            mapped
                        }
                        Err(err) => Some(Err(BackendError::transport(format!(
                            "SSE stream error: {err}"
                        )))),
                    }
                }
            });

        Ok(Box::pin(stream))
    }

    /// Posts a permission decision back to the agent server.
    ///
    /// # Errors
    /// Returns a transport error when no session is cached or the POST
    /// fails.
    pub async fn respond_permission(
        &self,
        conversation_id: &str,
        request_id: &str,
        outcome: &PermissionOutcome,
    ) -> Result<(), BackendError> {
        let session_id = self.resume_token(conversation_id).ok_or_else(|| {
            BackendError::transport(format!(
                "No agent session for conversation '{conversation_id}'"
            ))
        })?;

        let body = match outcome {
            PermissionOutcome::Approved { updated_input } => {
                let mut body = json!({"behavior": "allow"});
                if let Some(input) = updated_input {
                    body["updatedInput"] = input.clone();
                }
                body
            }
            other => json!({
                "behavior": "deny",
                "message": other.deny_reason().unwrap_or_default(),
            }),
        };

        let url = format!(
            "{}/v1/sessions/{session_id}/permissions/{request_id}",
            self.endpoint
        );
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                BackendError::transport(format!("Failed to deliver permission decision: {err}"))
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::http_status(status.as_u16(), &body));
        }
        Ok(())
    }

    /// Asks the agent server to abandon the conversation's stream.
    pub async fn interrupt(&self, conversation_id: &str) {
        let Some(session_id) = self.resume_token(conversation_id) else {
            return;
        };
        let url = format!("{}/v1/sessions/{session_id}/interrupt", self.endpoint);
        if let Err(err) = self.http.post(&url).send().await {
            tracing::warn!(conversation_id, %err, "failed to interrupt agent session");
        }
    }

    pub fn resume_token(&self, conversation_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .get(conversation_id)
            .cloned()
    }

    pub fn clear_session(&self, conversation_id: &str) {
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .remove(conversation_id);
    }
}

#[derive(Debug, Deserialize)]
struct SseInit {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct SseText {
    text: String,
}

#[derive(Debug, Deserialize)]
struct SseToolUse {
    id: String,
    name: String,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Deserialize)]
struct SseToolResult {
    tool_use_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct SsePermissionRequest {
    request_id: String,
    tool_name: String,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Deserialize)]
struct SseUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct SseResult {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    num_turns: Option<u32>,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct SseError {
    #[serde(rename = "type", default)]
    error_type: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SseResearchResult {
    text: String,
    #[serde(default)]
    sources: Vec<ResearchSource>,
}

fn decode<T: serde::de::DeserializeOwned>(
    event_name: &str,
    data: &str,
) -> Result<T, BackendError> {
    serde_json::from_str(data)
        .map_err(|err| BackendError::parse(format!("Failed to parse {event_name} event: {err}")))
}

/// Maps one SSE event to a backend event. `None` drops keepalives and
/// unknown event names.
fn map_sse_event(event_name: &str, data: &str) -> Option<Result<BackendEvent, BackendError>> {
    match event_name {
        "ping" => None,
        "init" => Some(decode::<SseInit>(event_name, data).map(|init| {
            BackendEvent::SessionStarted {
                session_id: init.session_id,
            }
        })),
        "text" => Some(
            decode::<SseText>(event_name, data)
                .map(|t| BackendEvent::AssistantText { text: t.text }),
        ),
        "tool_use" => Some(decode::<SseToolUse>(event_name, data).map(|t| {
            BackendEvent::ToolUse {
                call_id: t.id,
                name: t.name,
                input: t.input,
            }
        })),
        "tool_result" => Some(decode::<SseToolResult>(event_name, data).map(|t| {
            BackendEvent::ToolResult {
                call_id: t.tool_use_id,
                content: t.content,
                is_error: t.is_error,
            }
        })),
        "permission_request" => Some(decode::<SsePermissionRequest>(event_name, data).map(|p| {
            BackendEvent::PermissionAsked {
                request_id: p.request_id,
                tool_name: p.tool_name,
                input: p.input,
            }
        })),
        "usage" => Some(decode::<SseUsage>(event_name, data).map(|u| {
            BackendEvent::AssistantUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            }
        })),
        "research_result" => Some(decode::<SseResearchResult>(event_name, data).map(|r| {
            BackendEvent::ResearchResult {
                text: r.text,
                sources: r.sources,
            }
        })),
        "result" => Some(decode::<SseResult>(event_name, data).map(|r| {
            BackendEvent::Completed(ResultEnvelope {
                session_id: r.session_id,
                cost_usd: r.total_cost_usd,
                duration_ms: r.duration_ms,
                num_turns: r.num_turns,
                is_error: r.is_error,
            })
        })),
        "error" => Some(match decode::<SseError>(event_name, data) {
            Ok(err) => Err(BackendError::api(format!(
                "{}: {}",
                err.error_type, err.message
            ))),
            Err(parse_err) => Err(parse_err),
        }),
        _ => None,
    }
}
