//! CLI subprocess adapter.
//!
//! Spawns the configured agent binary with piped stdio, writes the operator
//! message as a newline-delimited JSON record, and incrementally parses the
//! child's stdout into [`BackendEvent`]s. Permission decisions travel back
//! to the child as `control_response` records on stdin; interrupt kills the
//! child.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_stream::stream;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};

use crate::config::AgentBackendConfig;
use crate::error::BackendError;
use crate::gate::PermissionOutcome;

use super::{BackendEvent, BackendStream, InvokeRequest, ResultEnvelope};

/// Upper bound for one accumulated JSON record (1 MiB).
const MAX_RECORD_BYTES: usize = 1024 * 1024;
/// Stderr tail kept for error reporting.
const MAX_STDERR_BYTES: usize = 4 * 1024;

struct ActiveTurn {
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
}

/// Subprocess-based coding-agent adapter.
pub struct CliBackend {
    config: AgentBackendConfig,
    turns: Arc<Mutex<HashMap<String, ActiveTurn>>>,
    tokens: Arc<Mutex<HashMap<String, String>>>,
}

impl CliBackend {
    pub fn new(config: AgentBackendConfig) -> Self {
        Self {
            config,
            turns: Arc::new(Mutex::new(HashMap::new())),
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn build_command(&self, request: &InvokeRequest) -> Command {
        let mut command = Command::new(&self.config.binary);
        command
            .arg("--output-format")
            .arg("stream-json")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--permission-mode")
            .arg(request.permission_mode.id());
        if let Some(model) = &request.model {
            command.arg("--model").arg(model);
        }
        if !request.allowed_tools.is_empty() {
            command
                .arg("--allowed-tools")
                .arg(request.allowed_tools.join(","));
        }
        if let Some(token) = &request.resume_token {
            command.arg("--resume").arg(token);
        }
        command.args(&self.config.extra_args);
        command
            .current_dir(&request.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Starts one turn: spawn, send the user record, stream stdout.
    ///
    /// # Errors
    /// Returns a configuration error when the binary is missing, a
    /// transport error for any other spawn failure.
    pub async fn invoke(&self, request: InvokeRequest) -> Result<BackendStream, BackendError> {
        let mut child = self.build_command(&request).spawn().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                BackendError::config(format!(
                    "Agent binary '{}' not found in PATH",
                    self.config.binary
                ))
            } else {
                BackendError::transport(format!(
                    "Failed to spawn '{}': {err}",
                    self.config.binary
                ))
            }
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::transport("Child stdin not available"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::transport("Child stdout not available"))?;
        let stderr = child.stderr.take();

        let user_record = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{"type": "text", "text": request.prompt}],
            },
        });
        write_record(&mut stdin, &user_record).await?;

        let stderr_tail = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = stderr {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = tail.lock().expect("stderr lock poisoned");
                    if tail.len() < MAX_STDERR_BYTES {
                        tail.push_str(&line);
                        tail.push('\n');
                    }
                }
            });
        }

        let turn = ActiveTurn {
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            child: Arc::new(tokio::sync::Mutex::new(Some(child))),
        };
        let child_slot = Arc::clone(&turn.child);
        {
            let mut turns = self.turns.lock().expect("turns lock poisoned");
            turns.insert(request.conversation_id.clone(), turn);
        }

        let turns = Arc::clone(&self.turns);
        let tokens = Arc::clone(&self.tokens);
        let conversation_id = request.conversation_id.clone();
        let cancel = request.cancel.clone();

        let stream = stream! {
            let mut lines = BufReader::new(stdout).lines();
            let mut assembler = RecordAssembler::new(MAX_RECORD_BYTES);

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(BackendError::transport(format!(
                            "Failed to read agent output: {err}"
                        )));
                        break;
                    }
                };
                for item in assembler.push_line(&line) {
                    if let Ok(BackendEvent::SessionStarted { session_id }) = &item {
                        let mut tokens = tokens.lock().expect("tokens lock poisoned");
                        tokens.insert(conversation_id.clone(), session_id.clone());
                    }
                    yield item;
                }
            }

            // Surface a non-zero exit unless the turn was interrupted, in
            // which case the kill is expected.
            let child = child_slot.lock().await.take();
            if let Some(mut child) = child {
                match child.wait().await {
                    Ok(status) if !status.success() && !cancel.is_cancelled() => {
                        let tail = stderr_tail.lock().expect("stderr lock poisoned").clone();
                        let mut err = BackendError::transport(format!(
                            "Agent process exited with {status}"
                        ));
                        if !tail.trim().is_empty() {
                            err = err.with_details(tail.trim().to_string());
                        }
                        yield Err(err);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        yield Err(BackendError::transport(format!(
                            "Failed to reap agent process: {err}"
                        )));
                    }
                }
            }

            let mut turns = turns.lock().expect("turns lock poisoned");
            turns.remove(&conversation_id);
        };

        Ok(Box::pin(stream))
    }

    /// Writes a permission decision to the child's stdin.
    ///
    /// # Errors
    /// Returns a transport error when the turn is gone or the write fails.
    pub async fn respond_permission(
        &self,
        conversation_id: &str,
        request_id: &str,
        outcome: &PermissionOutcome,
    ) -> Result<(), BackendError> {
        let stdin = {
            let turns = self.turns.lock().expect("turns lock poisoned");
            turns
                .get(conversation_id)
                .map(|turn| Arc::clone(&turn.stdin))
        };
        let Some(stdin) = stdin else {
            return Err(BackendError::transport(format!(
                "No running agent process for conversation '{conversation_id}'"
            )));
        };

        let response = match outcome {
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
        let record = json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": request_id,
                "response": response,
            },
        });

        let mut stdin = stdin.lock().await;
        write_record(&mut stdin, &record).await
    }

    /// Kills the conversation's child process, if one is running.
    pub async fn interrupt(&self, conversation_id: &str) {
        let child = {
            let mut turns = self.turns.lock().expect("turns lock poisoned");
            turns.remove(conversation_id).map(|turn| turn.child)
        };
        let Some(child) = child else { return };
        let mut child = child.lock().await;
        if let Some(child) = child.as_mut()
            && let Err(err) = child.start_kill()
        {
            tracing::warn!(conversation_id, %err, "failed to kill agent process");
        }
    }

    pub fn resume_token(&self, conversation_id: &str) -> Option<String> {
        let tokens = self.tokens.lock().expect("tokens lock poisoned");
        tokens.get(conversation_id).cloned()
    }

    pub fn clear_session(&self, conversation_id: &str) {
        let mut tokens = self.tokens.lock().expect("tokens lock poisoned");
        tokens.remove(conversation_id);
    }
}

async fn write_record(stdin: &mut ChildStdin, record: &Value) -> Result<(), BackendError> {
    let mut line = record.to_string();
    line.push('\n');
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|err| BackendError::transport(format!("Failed to write to agent stdin: {err}")))?;
    stdin
        .flush()
        .await
        .map_err(|err| BackendError::transport(format!("Failed to flush agent stdin: {err}")))
}

/// Incremental NDJSON record assembler.
///
/// A record usually fits one line, but pretty-printed or chunked output is
/// tolerated by accumulating lines until the buffer parses. Anything that
/// never looks like JSON passes through as raw assistant text.
struct RecordAssembler {
    buffer: String,
    max_bytes: usize,
}

impl RecordAssembler {
    fn new(max_bytes: usize) -> Self {
        Self {
            buffer: String::new(),
            max_bytes,
        }
    }

    fn push_line(&mut self, line: &str) -> Vec<Result<BackendEvent, BackendError>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        if self.buffer.is_empty() {
            if !trimmed.starts_with('{') {
                return vec![Ok(BackendEvent::AssistantText {
                    text: format!("{line}\n"),
                })];
            }
            self.buffer.push_str(trimmed);
        } else {
            self.buffer.push_str(trimmed);
        }

        if self.buffer.len() > self.max_bytes {
            self.buffer.clear();
            return vec![Err(BackendError::parse(format!(
                "Agent record exceeded {} bytes",
                self.max_bytes
            )))];
        }

        match serde_json::from_str::<Value>(&self.buffer) {
            Ok(record) => {
                self.buffer.clear();
                parse_record(&record).into_iter().map(Ok).collect()
            }
            // Not complete yet; keep accumulating.
            Err(_) => Vec::new(),
        }
    }
}

/// Maps one decoded agent record to zero or more backend events.
fn parse_record(record: &Value) -> Vec<BackendEvent> {
    match record.get("type").and_then(Value::as_str) {
        Some("system") => parse_system(record),
        Some("assistant") => parse_assistant(record),
        Some("user") => parse_tool_results(record),
        Some("control_request") => parse_control_request(record),
        Some("result") => vec![BackendEvent::Completed(parse_result(record))],
        _ => Vec::new(),
    }
}

fn parse_system(record: &Value) -> Vec<BackendEvent> {
    if record.get("subtype").and_then(Value::as_str) != Some("init") {
        return Vec::new();
    }
    record
        .get("session_id")
        .and_then(Value::as_str)
        .map(|session_id| {
            vec![BackendEvent::SessionStarted {
                session_id: session_id.to_string(),
            }]
        })
        .unwrap_or_default()
}

fn parse_assistant(record: &Value) -> Vec<BackendEvent> {
    let Some(message) = record.get("message") else {
        return Vec::new();
    };
    let mut events = Vec::new();
    if let Some(blocks) = message.get("content").and_then(Value::as_array) {
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        events.push(BackendEvent::AssistantText {
                            text: text.to_string(),
                        });
                    }
                }
                Some("tool_use") => {
                    events.push(BackendEvent::ToolUse {
                        call_id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }
    }
    if let Some(usage) = message.get("usage") {
        events.push(BackendEvent::AssistantUsage {
            input_tokens: usage
                .get("input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: usage
                .get("output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        });
    }
    events
}

fn parse_tool_results(record: &Value) -> Vec<BackendEvent> {
    let Some(blocks) = record
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
        .map(|block| BackendEvent::ToolResult {
            call_id: block
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            content: tool_result_text(block.get("content")),
            is_error: block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
        .collect()
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn parse_control_request(record: &Value) -> Vec<BackendEvent> {
    let Some(request_id) = record.get("request_id").and_then(Value::as_str) else {
        return Vec::new();
    };
    let Some(request) = record.get("request") else {
        return Vec::new();
    };
    if request.get("subtype").and_then(Value::as_str) != Some("can_use_tool") {
        return Vec::new();
    }
    vec![BackendEvent::PermissionAsked {
        request_id: request_id.to_string(),
        tool_name: request
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        input: request.get("input").cloned().unwrap_or(Value::Null),
    }]
}

fn parse_result(record: &Value) -> ResultEnvelope {
    ResultEnvelope {
        session_id: record
            .get("session_id")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        cost_usd: record.get("total_cost_usd").and_then(Value::as_f64),
        duration_ms: record.get("duration_ms").and_then(Value::as_u64),
        num_turns: record
            .get("num_turns")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
        is_error: record
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// Returns whether a binary resolves on PATH or as a direct path.
///
/// Used by callers that want to fail fast before starting a turn.
pub fn binary_available(binary: &str) -> bool {
    let direct = Path::new(binary);
    if direct.components().count() > 1 {
        return direct.exists();
    }
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(binary).exists())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_init_record_captures_session() {
        let record = json!({"type": "system", "subtype": "init", "session_id": "sess_1"});
        let events = parse_record(&record);
        assert_eq!(
            events,
            vec![BackendEvent::SessionStarted {
                session_id: "sess_1".to_string()
            }]
        );
    }

    #[test]
    fn test_parse_assistant_text_and_tool_use() {
        let record = json!({
            "type": "assistant",
            "message": {
                "content": [
                    {"type": "text", "text": "let me check"},
                    {"type": "tool_use", "id": "call_1", "name": "bash",
                     "input": {"command": "ls"}},
                ],
                "usage": {"input_tokens": 10, "output_tokens": 5},
            },
        });
        let events = parse_record(&record);
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            BackendEvent::AssistantText { text } if text == "let me check"
        ));
        assert!(matches!(
            &events[1],
            BackendEvent::ToolUse { call_id, name, .. }
                if call_id == "call_1" && name == "bash"
        ));
        assert!(matches!(
            &events[2],
            BackendEvent::AssistantUsage { input_tokens: 10, output_tokens: 5 }
        ));
    }

    #[test]
    fn test_parse_tool_result_with_block_content() {
        let record = json!({
            "type": "user",
            "message": {
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": "call_1",
                    "content": [{"type": "text", "text": "file.txt"}],
                    "is_error": false,
                }],
            },
        });
        let events = parse_record(&record);
        assert_eq!(
            events,
            vec![BackendEvent::ToolResult {
                call_id: "call_1".to_string(),
                content: "file.txt".to_string(),
                is_error: false,
            }]
        );
    }

    #[test]
    fn test_parse_control_request() {
        let record = json!({
            "type": "control_request",
            "request_id": "req_1",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "bash",
                "input": {"command": "rm -rf /tmp/x"},
            },
        });
        let events = parse_record(&record);
        assert!(matches!(
            &events[0],
            BackendEvent::PermissionAsked { request_id, tool_name, .. }
                if request_id == "req_1" && tool_name == "bash"
        ));
    }

    #[test]
    fn test_parse_result_envelope() {
        let record = json!({
            "type": "result",
            "session_id": "sess_1",
            "total_cost_usd": 0.42,
            "duration_ms": 1234,
            "num_turns": 3,
            "is_error": false,
        });
        let events = parse_record(&record);
        let BackendEvent::Completed(envelope) = &events[0] else {
            panic!("expected Completed");
        };
        assert_eq!(envelope.session_id.as_deref(), Some("sess_1"));
        assert_eq!(envelope.cost_usd, Some(0.42));
        assert_eq!(envelope.duration_ms, Some(1234));
        assert_eq!(envelope.num_turns, Some(3));
    }

    #[test]
    fn test_assembler_passes_raw_text_through() {
        let mut assembler = RecordAssembler::new(MAX_RECORD_BYTES);
        let events = assembler.push_line("plain progress output");
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            BackendEvent::AssistantText { text } if text == "plain progress output\n"
        ));
    }

    #[test]
    fn test_assembler_buffers_split_records() {
        let mut assembler = RecordAssembler::new(MAX_RECORD_BYTES);
        assert!(assembler
            .push_line(r#"{"type": "system", "subtype": "init","#)
            .is_empty());
        let events = assembler.push_line(r#""session_id": "sess_9"}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            BackendEvent::SessionStarted { session_id } if session_id == "sess_9"
        ));
    }

    #[test]
    fn test_assembler_rejects_oversized_record() {
        let mut assembler = RecordAssembler::new(64);
        assert!(assembler.push_line("{\"key\": \"start").is_empty());
        let filler = "x".repeat(100);
        let events = assembler.push_line(&filler);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_err());
    }

    #[test]
    fn test_unknown_record_types_are_ignored() {
        let record = json!({"type": "telemetry", "data": 1});
        assert!(parse_record(&record).is_empty());
    }
}
