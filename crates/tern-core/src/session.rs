//! Session registry: at most one in-flight turn per conversation.
//!
//! The registry is a keyed table of turn handles guarded by a plain mutex.
//! No operation holds the lock across an await; `begin_turn` awaits a
//! superseded turn's cleanup only after releasing it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handle owned by a running turn task.
///
/// Dropping the handle marks the turn as finished, so cleanup is signalled
/// even if the task unwinds.
#[derive(Debug)]
pub struct TurnHandle {
    pub conversation_id: String,
    pub turn_id: Uuid,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl TurnHandle {
    /// Token tripped when the operator stops the turn or a new turn
    /// supersedes it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns true once a stop has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TurnHandle {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

#[derive(Debug, Clone)]
struct RegisteredTurn {
    turn_id: Uuid,
    cancel: CancellationToken,
    done: CancellationToken,
}

/// Per-conversation map of running turns.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    turns: Mutex<HashMap<String, RegisteredTurn>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new turn handle for the conversation.
    ///
    /// Any existing turn is cancelled first, and its cleanup is awaited
    /// before the new handle is installed, so a superseded turn's final
    /// messages land in the store before the new turn appends anything.
    pub async fn begin_turn(&self, conversation_id: &str) -> TurnHandle {
        loop {
            let existing = {
                let mut turns = self.turns.lock().expect("registry lock poisoned");
                turns.remove(conversation_id)
            };
            let Some(existing) = existing else { break };
            existing.cancel.cancel();
            existing.done.cancelled().await;
        }

        let registered = RegisteredTurn {
            turn_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        };
        {
            let mut turns = self.turns.lock().expect("registry lock poisoned");
            turns.insert(conversation_id.to_string(), registered.clone());
        }
        TurnHandle {
            conversation_id: conversation_id.to_string(),
            turn_id: registered.turn_id,
            cancel: registered.cancel,
            done: registered.done,
        }
    }

    /// Removes the turn only if it is still the current one.
    ///
    /// Guards against a just-cancelled turn's cleanup racing a newly
    /// started turn.
    pub fn end_turn(&self, conversation_id: &str, turn_id: Uuid) {
        let mut turns = self.turns.lock().expect("registry lock poisoned");
        if turns
            .get(conversation_id)
            .is_some_and(|t| t.turn_id == turn_id)
        {
            turns.remove(conversation_id);
        }
    }

    /// Requests cancellation of the conversation's running turn, if any.
    ///
    /// Idempotent: cancelling an idle conversation or an already-cancelled
    /// turn is a no-op.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let turns = self.turns.lock().expect("registry lock poisoned");
        match turns.get(conversation_id) {
            Some(turn) => {
                turn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Returns true while a turn is registered for the conversation.
    pub fn is_busy(&self, conversation_id: &str) -> bool {
        self.turns
            .lock()
            .expect("registry lock poisoned")
            .contains_key(conversation_id)
    }

    /// Number of registered turns, across all conversations.
    pub fn active_turns(&self) -> usize {
        self.turns.lock().expect("registry lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{Duration, timeout};

    use super::*;

    #[tokio::test]
    async fn test_begin_turn_installs_single_handle() {
        let registry = Arc::new(SessionRegistry::new());
        let handle = registry.begin_turn("c1").await;
        assert!(registry.is_busy("c1"));
        assert_eq!(registry.active_turns(), 1);
        drop(handle);
    }

    #[tokio::test]
    async fn test_begin_turn_cancels_and_waits_for_predecessor() {
        let registry = Arc::new(SessionRegistry::new());
        let first = registry.begin_turn("c1").await;
        let first_cancel = first.cancel_token().clone();

        // Simulate the first turn's task: it releases its handle once it
        // observes cancellation.
        let worker = tokio::spawn(async move {
            first.cancel_token().cancelled().await;
            drop(first);
        });

        let second = timeout(Duration::from_secs(1), registry.begin_turn("c1"))
            .await
            .expect("begin_turn should not hang");
        assert!(first_cancel.is_cancelled());
        assert_eq!(registry.active_turns(), 1);
        worker.await.unwrap();
        drop(second);
    }

    #[tokio::test]
    async fn test_end_turn_ignores_stale_turn_id() {
        let registry = Arc::new(SessionRegistry::new());
        let first = registry.begin_turn("c1").await;
        let stale_id = first.turn_id;

        // First turn ends; a second turn starts.
        drop(first);
        let second = registry.begin_turn("c1").await;

        // The stale cleanup must not evict the new turn.
        registry.end_turn("c1", stale_id);
        assert!(registry.is_busy("c1"));

        registry.end_turn("c1", second.turn_id);
        assert!(!registry.is_busy("c1"));
        drop(second);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let registry = Arc::new(SessionRegistry::new());
        assert!(!registry.cancel("idle"));

        let handle = registry.begin_turn("c1").await;
        assert!(registry.cancel("c1"));
        assert!(registry.cancel("c1"));
        assert!(handle.is_cancelled());
        drop(handle);
    }

    #[tokio::test]
    async fn test_concurrent_begin_turn_leaves_one_handle() {
        let registry = Arc::new(SessionRegistry::new());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let handle = registry.begin_turn("c1").await;
                // Hold briefly, reacting to supersession like a real turn.
                tokio::select! {
                    () = handle.cancel_token().cancelled() => {}
                    () = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
                registry.end_turn("c1", handle.turn_id);
                drop(handle);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(!registry.is_busy("c1"));
        assert_eq!(registry.active_turns(), 0);
    }
}
