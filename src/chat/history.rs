//! Chat-session records as they are persisted in the session store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// One text conversation, shared with the voice pipeline by session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Messages ever accepted, including ones trimmed from `messages`
    pub message_count: u64,
    pub messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            created_at: now,
            last_activity: now,
            message_count: 0,
            messages: Vec::new(),
        }
    }

    /// Store key for a session record.
    pub fn store_key(session_id: &str) -> String {
        format!("chat:session:{}", session_id)
    }

    /// Append a message, keeping at most `max_history` of the newest ones.
    pub fn push(&mut self, message: ChatMessage, max_history: usize) {
        self.last_activity = message.timestamp;
        self.message_count += 1;
        self.messages.push(message);

        if self.messages.len() > max_history {
            let excess = self.messages.len() - max_history;
            self.messages.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_trims_oldest_but_keeps_count() {
        let mut session = ChatSession::new("s1");
        for i in 0..5 {
            session.push(ChatMessage::new(Role::User, format!("m{}", i)), 3);
        }

        assert_eq!(session.message_count, 5);
        let contents: Vec<&str> = session.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let msg = ChatMessage::new(Role::Assistant, "hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");

        let back: ChatMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }
}
