//! File-backed message store.
//!
//! Layout: one directory per conversation under the store root, holding a
//! `conversation.json` metadata file and an append-only `messages.jsonl`
//! log (one message per line).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::message::Message;

use super::{Conversation, ConversationPatch, MessageStore};

const CONVERSATION_FILE: &str = "conversation.json";
const MESSAGES_FILE: &str = "messages.jsonl";

/// JSONL-backed store rooted at a directory.
#[derive(Debug, Clone)]
pub struct JsonlStore {
    root: PathBuf,
}

impl JsonlStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    /// Returns an error if the root directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("create store root {}", root.display()))?;
        Ok(Self { root })
    }

    /// Opens the store at the default location
    /// (`${TERN_HOME}/conversations`).
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn open_default() -> Result<Self> {
        Self::new(crate::config::paths::conversations_dir())
    }

    fn conversation_dir(&self, conversation_id: &str) -> PathBuf {
        self.root.join(sanitize_id(conversation_id))
    }

    fn read_conversation(&self, dir: &Path) -> Result<Conversation> {
        let path = dir.join(CONVERSATION_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("read conversation {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parse conversation {}", path.display()))
    }

    fn write_conversation(&self, dir: &Path, conversation: &Conversation) -> Result<()> {
        let path = dir.join(CONVERSATION_FILE);
        let content =
            serde_json::to_string_pretty(conversation).context("serialize conversation")?;
        fs::write(&path, content)
            .with_context(|| format!("write conversation {}", path.display()))
    }
}

impl MessageStore for JsonlStore {
    fn create(&self, conversation: Conversation) -> Result<()> {
        let dir = self.conversation_dir(&conversation.id);
        if dir.join(CONVERSATION_FILE).exists() {
            bail!("Conversation '{}' already exists", conversation.id);
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("create conversation dir {}", dir.display()))?;
        self.write_conversation(&dir, &conversation)
    }

    fn append(&self, conversation_id: &str, message: &Message) -> Result<()> {
        let dir = self.conversation_dir(conversation_id);
        if !dir.join(CONVERSATION_FILE).exists() {
            bail!("Conversation '{conversation_id}' not found");
        }
        let line = serde_json::to_string(message).context("serialize message")?;
        let path = dir.join(MESSAGES_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open message log {}", path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("append message to {}", path.display()))?;
        Ok(())
    }

    fn update_conversation(
        &self,
        conversation_id: &str,
        patch: ConversationPatch,
    ) -> Result<Conversation> {
        let dir = self.conversation_dir(conversation_id);
        let mut conversation = self.read_conversation(&dir)?;
        patch.apply(&mut conversation);
        self.write_conversation(&dir, &conversation)?;
        Ok(conversation)
    }

    fn load(&self, conversation_id: &str) -> Result<(Conversation, Vec<Message>)> {
        let dir = self.conversation_dir(conversation_id);
        let conversation = self.read_conversation(&dir)?;

        let path = dir.join(MESSAGES_FILE);
        let mut messages = Vec::new();
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("read message log {}", path.display()))?;
            for line in content.lines() {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(trimmed) {
                    Ok(message) => messages.push(message),
                    Err(err) => {
                        tracing::warn!(
                            conversation_id,
                            %err,
                            "skipping malformed message line"
                        );
                    }
                }
            }
        }
        Ok((conversation, messages))
    }

    fn list(&self) -> Result<Vec<Conversation>> {
        let mut conversations = Vec::new();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("read store root {}", self.root.display()))?;
        for entry in entries {
            let entry = entry.context("read store entry")?;
            let dir = entry.path();
            if !dir.is_dir() || !dir.join(CONVERSATION_FILE).exists() {
                continue;
            }
            match self.read_conversation(&dir) {
                Ok(conversation) => conversations.push(conversation),
                Err(err) => {
                    tracing::warn!(path = %dir.display(), %err, "skipping unreadable conversation");
                }
            }
        }
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }
}

fn sanitize_id(input: &str) -> String {
    let mut out = String::new();
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    let trimmed = if trimmed.is_empty() {
        "conversation"
    } else {
        trimmed
    };
    trimmed.chars().take(64).collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::tempdir;

    use crate::backend::AgentKind;
    use crate::message::{Message, MessagePayload};

    use super::*;

    fn sample_conversation(id: &str) -> Conversation {
        Conversation::new(id, PathBuf::from("/tmp/repo"), AgentKind::Agent)
    }

    #[test]
    fn test_roundtrip_preserves_append_order() {
        let dir = tempdir().unwrap();
        let store = JsonlStore::new(dir.path()).unwrap();
        store.create(sample_conversation("c1")).unwrap();

        let texts = ["one", "two", "three"];
        for text in texts {
            store.append("c1", &Message::user(text)).unwrap();
        }

        let (_, messages) = store.load("c1").unwrap();
        assert_eq!(messages.len(), 3);
        for (message, expected) in messages.iter().zip(texts) {
            assert!(
                matches!(&message.payload, MessagePayload::User { text } if text == expected)
            );
        }
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = tempdir().unwrap();
        let store = JsonlStore::new(dir.path()).unwrap();
        store.create(sample_conversation("c1")).unwrap();
        assert!(store.create(sample_conversation("c1")).is_err());
    }

    #[test]
    fn test_append_to_unknown_conversation_fails() {
        let dir = tempdir().unwrap();
        let store = JsonlStore::new(dir.path()).unwrap();
        assert!(store.append("missing", &Message::user("hi")).is_err());
    }

    #[test]
    fn test_update_conversation_patches_and_bumps_timestamp() {
        let dir = tempdir().unwrap();
        let store = JsonlStore::new(dir.path()).unwrap();
        let conversation = sample_conversation("c1");
        let before = conversation.updated_at;
        store.create(conversation).unwrap();

        let updated = store
            .update_conversation("c1", ConversationPatch::resume_token("sess_42"))
            .unwrap();
        assert_eq!(updated.resume_token.as_deref(), Some("sess_42"));
        assert!(updated.resume_token_created_at.is_some());
        assert!(updated.updated_at >= before);

        let cleared = store
            .update_conversation("c1", ConversationPatch::clear_resume_token())
            .unwrap();
        assert!(cleared.resume_token.is_none());
        assert!(cleared.resume_token_created_at.is_none());
    }

    #[test]
    fn test_load_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let store = JsonlStore::new(dir.path()).unwrap();
        store.create(sample_conversation("c1")).unwrap();
        store.append("c1", &Message::user("ok")).unwrap();

        let log = dir.path().join("c1").join(MESSAGES_FILE);
        let mut content = std::fs::read_to_string(&log).unwrap();
        content.push_str("{not json}\n");
        std::fs::write(&log, content).unwrap();
        store.append("c1", &Message::user("after")).unwrap();

        let (_, messages) = store.load("c1").unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_list_sorts_most_recent_first() {
        let dir = tempdir().unwrap();
        let store = JsonlStore::new(dir.path()).unwrap();
        store.create(sample_conversation("older")).unwrap();
        store.create(sample_conversation("newer")).unwrap();
        store
            .update_conversation("older", ConversationPatch::title("bumped"))
            .unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "older");
    }

    #[test]
    fn test_sanitize_id_replaces_separators() {
        assert_eq!(sanitize_id("a/b c"), "a-b-c");
        assert_eq!(sanitize_id("///"), "conversation");
    }
}
