//! Permission gate: operator approval for risky tool invocations.
//!
//! A backend asking to run a gated tool suspends its turn here until an
//! external caller resolves the request, a timeout elapses, or the owning
//! turn is cancelled. Each pending entry is a deferred slot; the decision
//! is a race over the three signal sources.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::{EventSender, OrchestratorEvent};

/// Auto-deny reason applied when a request waits out its timeout.
pub const TIMEOUT_DENY_REASON: &str = "Permission request timed out";
/// Deny reason applied when the owning turn stops.
pub const CANCELLED_DENY_REASON: &str = "Turn was interrupted";

/// Operator decision submitted through `resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Replacement tool input, honored only on approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
}

impl PermissionResponse {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
            updated_input: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
            updated_input: None,
        }
    }
}

/// How a pending request was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionOutcome {
    Approved { updated_input: Option<Value> },
    Denied { reason: String },
    TimedOut,
    Cancelled,
}

impl PermissionOutcome {
    /// Collapses the outcome into the allow/deny contract backends
    /// understand. Timeout and cancellation surface as denials with
    /// standard reasons; the distinction stays visible to gate callers.
    pub fn deny_reason(&self) -> Option<&str> {
        match self {
            PermissionOutcome::Approved { .. } => None,
            PermissionOutcome::Denied { reason } => Some(reason),
            PermissionOutcome::TimedOut => Some(TIMEOUT_DENY_REASON),
            PermissionOutcome::Cancelled => Some(CANCELLED_DENY_REASON),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, PermissionOutcome::Approved { .. })
    }
}

struct PendingPermission {
    tx: oneshot::Sender<PermissionOutcome>,
}

/// Table of outstanding permission requests.
pub struct PermissionGate {
    pending: Mutex<HashMap<String, PendingPermission>>,
    timeout: Duration,
}

impl PermissionGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Registers a request, notifies the UI channel, and suspends until a
    /// decision arrives.
    ///
    /// The request id is prefixed with the conversation id so
    /// [`cancel_conversation`](Self::cancel_conversation) can reject every
    /// request belonging to a stopping turn.
    pub async fn request(
        &self,
        conversation_id: &str,
        tool_name: &str,
        input: Value,
        cancel: &CancellationToken,
        events: &EventSender,
    ) -> PermissionOutcome {
        let request_id = format!("{conversation_id}:{}", Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("gate lock poisoned");
            pending.insert(request_id.clone(), PendingPermission { tx });
        }

        events
            .send_important(OrchestratorEvent::PermissionRequested {
                conversation_id: conversation_id.to_string(),
                request_id: request_id.clone(),
                tool_name: tool_name.to_string(),
                input,
            })
            .await;

        let outcome = tokio::select! {
            decision = rx => decision.unwrap_or(PermissionOutcome::Cancelled),
            () = tokio::time::sleep(self.timeout) => PermissionOutcome::TimedOut,
            () = cancel.cancelled() => PermissionOutcome::Cancelled,
        };

        // The resolver path already removed the entry; the timeout and
        // cancellation paths clean up here.
        self.pending
            .lock()
            .expect("gate lock poisoned")
            .remove(&request_id);

        outcome
    }

    /// Settles a pending request. Returns `false` when no matching entry
    /// exists (already resolved, expired, or cancelled); safe to call
    /// repeatedly.
    pub fn resolve(&self, request_id: &str, response: PermissionResponse) -> bool {
        let entry = {
            let mut pending = self.pending.lock().expect("gate lock poisoned");
            pending.remove(request_id)
        };
        let Some(entry) = entry else {
            return false;
        };
        let outcome = if response.approved {
            PermissionOutcome::Approved {
                updated_input: response.updated_input,
            }
        } else {
            PermissionOutcome::Denied {
                reason: response
                    .reason
                    .unwrap_or_else(|| "Denied by user".to_string()),
            }
        };
        // The waiting turn may have been cancelled meanwhile; a dead
        // receiver is fine.
        let _ = entry.tx.send(outcome);
        true
    }

    /// Rejects every pending request belonging to the conversation with a
    /// stop-initiated outcome. Returns how many were rejected.
    pub fn cancel_conversation(&self, conversation_id: &str) -> usize {
        let prefix = format!("{conversation_id}:");
        let entries: Vec<PendingPermission> = {
            let mut pending = self.pending.lock().expect("gate lock poisoned");
            let ids: Vec<String> = pending
                .keys()
                .filter(|id| id.starts_with(&prefix))
                .cloned()
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };
        let count = entries.len();
        for entry in entries {
            let _ = entry.tx.send(PermissionOutcome::Cancelled);
        }
        count
    }

    /// Number of outstanding requests, across all conversations.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().expect("gate lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::time::Duration;

    use crate::events::create_event_channel;

    use super::*;

    fn gate_with_timeout(timeout: Duration) -> (Arc<PermissionGate>, EventSender) {
        let (tx, mut rx) = create_event_channel();
        // Drain events in the background so important sends never block.
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        (Arc::new(PermissionGate::new(timeout)), EventSender::new(tx))
    }

    #[tokio::test]
    async fn test_resolve_approves_pending_request() {
        let (gate, events) = gate_with_timeout(Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = Arc::clone(&gate);
            let events = events.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.request("c1", "bash", json!({"command": "ls"}), &cancel, &events)
                    .await
            })
        };

        // Wait for the entry to appear, then resolve it.
        while gate.pending_requests() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let request_id = {
            let pending = gate.pending.lock().unwrap();
            pending.keys().next().unwrap().clone()
        };
        assert!(request_id.starts_with("c1:"));
        assert!(gate.resolve(&request_id, PermissionResponse::approve()));

        let outcome = waiter.await.unwrap();
        assert!(outcome.is_approved());
        assert_eq!(gate.pending_requests(), 0);
        // Second resolve finds nothing.
        assert!(!gate.resolve(&request_id, PermissionResponse::approve()));
    }

    #[tokio::test]
    async fn test_deny_carries_reason() {
        let (gate, events) = gate_with_timeout(Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = Arc::clone(&gate);
            let events = events.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.request("c1", "write", json!({}), &cancel, &events).await
            })
        };

        while gate.pending_requests() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let request_id = {
            let pending = gate.pending.lock().unwrap();
            pending.keys().next().unwrap().clone()
        };
        gate.resolve(&request_id, PermissionResponse::deny("no"));

        let outcome = waiter.await.unwrap();
        assert_eq!(
            outcome,
            PermissionOutcome::Denied {
                reason: "no".to_string()
            }
        );
        assert_eq!(outcome.deny_reason(), Some("no"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_auto_denies_and_removes_entry() {
        let (gate, events) = gate_with_timeout(Duration::from_secs(300));
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = Arc::clone(&gate);
            let events = events.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.request("c1", "bash", json!({}), &cancel, &events).await
            })
        };

        // Paused clock: advancing past the timeout settles the request.
        tokio::time::sleep(Duration::from_secs(301)).await;
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome, PermissionOutcome::TimedOut);
        assert_eq!(outcome.deny_reason(), Some(TIMEOUT_DENY_REASON));
        assert_eq!(gate.pending_requests(), 0);
        assert!(!gate.resolve("c1:anything", PermissionResponse::approve()));
    }

    #[tokio::test]
    async fn test_cancel_conversation_rejects_all_pending_with_stop_reason() {
        let (gate, events) = gate_with_timeout(Duration::from_secs(300));
        let cancel = CancellationToken::new();

        let mut waiters = Vec::new();
        for tool in ["bash", "write", "edit"] {
            let gate = Arc::clone(&gate);
            let events = events.clone();
            let cancel = cancel.clone();
            waiters.push(tokio::spawn(async move {
                gate.request("c1", tool, json!({}), &cancel, &events).await
            }));
        }
        while gate.pending_requests() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // An unrelated conversation's request survives.
        let other_cancel = CancellationToken::new();
        let other = {
            let gate = Arc::clone(&gate);
            let events = events.clone();
            let cancel = other_cancel.clone();
            tokio::spawn(async move {
                gate.request("c2", "bash", json!({}), &cancel, &events).await
            })
        };
        while gate.pending_requests() < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(gate.cancel_conversation("c1"), 3);
        for waiter in waiters {
            let outcome = waiter.await.unwrap();
            assert_eq!(outcome, PermissionOutcome::Cancelled);
            assert_eq!(outcome.deny_reason(), Some(CANCELLED_DENY_REASON));
        }

        assert_eq!(gate.pending_requests(), 1);
        other_cancel.cancel();
        assert_eq!(other.await.unwrap(), PermissionOutcome::Cancelled);
    }
}
