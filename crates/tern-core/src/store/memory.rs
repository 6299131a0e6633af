//! In-memory message store for tests and embedding.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};

use crate::message::Message;

use super::{Conversation, ConversationPatch, MessageStore};

/// Store keeping conversations and logs in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Entry>>,
}

#[derive(Debug)]
struct Entry {
    conversation: Conversation,
    messages: Vec<Message>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryStore {
    fn create(&self, conversation: Conversation) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.contains_key(&conversation.id) {
            bail!("Conversation '{}' already exists", conversation.id);
        }
        inner.insert(
            conversation.id.clone(),
            Entry {
                conversation,
                messages: Vec::new(),
            },
        );
        Ok(())
    }

    fn append(&self, conversation_id: &str, message: &Message) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let entry = inner
            .get_mut(conversation_id)
            .ok_or_else(|| anyhow!("Conversation '{conversation_id}' not found"))?;
        entry.messages.push(message.clone());
        Ok(())
    }

    fn update_conversation(
        &self,
        conversation_id: &str,
        patch: ConversationPatch,
    ) -> Result<Conversation> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let entry = inner
            .get_mut(conversation_id)
            .ok_or_else(|| anyhow!("Conversation '{conversation_id}' not found"))?;
        patch.apply(&mut entry.conversation);
        Ok(entry.conversation.clone())
    }

    fn load(&self, conversation_id: &str) -> Result<(Conversation, Vec<Message>)> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let entry = inner
            .get(conversation_id)
            .ok_or_else(|| anyhow!("Conversation '{conversation_id}' not found"))?;
        Ok((entry.conversation.clone(), entry.messages.clone()))
    }

    fn list(&self) -> Result<Vec<Conversation>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut conversations: Vec<Conversation> =
            inner.values().map(|e| e.conversation.clone()).collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::backend::AgentKind;
    use crate::message::MessagePayload;

    use super::*;

    #[test]
    fn test_roundtrip() {
        let store = MemoryStore::new();
        store
            .create(Conversation::new(
                "c1",
                PathBuf::from("/tmp/repo"),
                AgentKind::Agent,
            ))
            .unwrap();
        store.append("c1", &Message::user("hello")).unwrap();

        let (conversation, messages) = store.load("c1").unwrap();
        assert_eq!(conversation.id, "c1");
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0].payload,
            MessagePayload::User { text } if text == "hello"
        ));
    }

    #[test]
    fn test_unknown_conversation_errors() {
        let store = MemoryStore::new();
        assert!(store.load("missing").is_err());
        assert!(store.append("missing", &Message::user("x")).is_err());
    }
}
