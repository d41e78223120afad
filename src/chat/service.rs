//! # Chat Service
//!
//! Turns one user message into one stored exchange: the message is checked
//! against the rate windows, answered by the reply generator and appended to
//! the session's history record. A refused or failed message leaves the
//! stored history untouched.
//!
//! The same service answers voice transcripts through `ReplyService`.

use crate::chat::history::{ChatMessage, ChatSession, Role};
use crate::chat::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::config::ChatConfig;
use crate::services::{ReplyError, ReplyGenerator, ReplyService};
use crate::store::{SessionStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one accepted chat message.
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub session_id: String,
    /// `None` when the generator declined to answer
    pub reply: Option<String>,
    pub message_count: u64,
    pub window_remaining: u32,
    pub session_remaining: u32,
    pub timestamp: DateTime<Utc>,
}

/// Chat sessions, history and rate windows on top of a reply generator.
pub struct ChatService {
    store: Arc<dyn SessionStore>,
    generator: Arc<dyn ReplyGenerator>,
    limiter: RateLimiter,
    session_ttl: Duration,
    max_history: usize,
    max_message_length: usize,
}

impl ChatService {
    pub fn new(store: Arc<dyn SessionStore>, generator: Arc<dyn ReplyGenerator>, config: &ChatConfig) -> Self {
        let session_ttl = Duration::from_secs(config.session_ttl_secs);
        let limiter = RateLimiter::new(
            Arc::clone(&store),
            RateLimitPolicy {
                window_limit: config.window_message_limit,
                window: Duration::from_secs(config.window_secs),
                session_limit: config.session_message_limit,
                session_ttl,
            },
        );

        Self {
            store,
            generator,
            limiter,
            session_ttl,
            max_history: config.max_history.max(1),
            max_message_length: config.max_message_length,
        }
    }

    async fn load(&self, session_id: &str) -> Result<Option<ChatSession>, ReplyError> {
        match self.store.get(&ChatSession::store_key(session_id)).await? {
            Some(raw) => {
                let session = serde_json::from_str(&raw).map_err(|e| {
                    StoreError::InvalidValue(format!("chat session {}: {}", session_id, e))
                })?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, session: &ChatSession) -> Result<(), ReplyError> {
        let raw = serde_json::to_string(session)
            .map_err(|e| StoreError::InvalidValue(format!("chat session {}: {}", session.session_id, e)))?;
        self.store
            .set(&ChatSession::store_key(&session.session_id), raw, Some(self.session_ttl))
            .await?;
        Ok(())
    }

    /// Load a chat session, creating and persisting it if absent or expired.
    pub async fn get_or_create_session(&self, session_id: &str) -> Result<ChatSession, ReplyError> {
        if let Some(session) = self.load(session_id).await? {
            return Ok(session);
        }

        let session = ChatSession::new(session_id);
        self.save(&session).await?;
        self.limiter.refresh(session_id).await?;
        tracing::debug!(session_id = %session_id, "Chat session created");
        Ok(session)
    }

    /// Accept one user message and generate a reply.
    ///
    /// ## Errors:
    /// - `InvalidInput` for blank or oversized messages
    /// - `RateLimited` when a cap is reached; nothing is persisted
    /// - `Generation` when the generator fails; nothing is persisted
    pub async fn send_message(&self, session_id: &str, message: &str) -> Result<ChatReply, ReplyError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ReplyError::InvalidInput("message is empty".to_string()));
        }
        if message.chars().count() > self.max_message_length {
            return Err(ReplyError::InvalidInput(format!(
                "message exceeds {} characters",
                self.max_message_length
            )));
        }

        let mut session = self.get_or_create_session(session_id).await?;
        let status = self.limiter.check(session_id).await?;

        let reply = self
            .generator
            .generate(session_id, message, &session.messages)
            .await
            .map_err(|e| ReplyError::Generation(e.to_string()))?;

        self.limiter.record(session_id).await?;
        session.push(ChatMessage::new(Role::User, message), self.max_history);
        if let Some(text) = &reply {
            session.push(ChatMessage::new(Role::Assistant, text.clone()), self.max_history);
        }
        self.save(&session).await?;

        tracing::debug!(
            session_id = %session_id,
            answered = reply.is_some(),
            message_count = session.message_count,
            "Chat message processed"
        );

        Ok(ChatReply {
            session_id: session_id.to_string(),
            reply,
            message_count: session.message_count,
            window_remaining: status.window_remaining.saturating_sub(1),
            session_remaining: status.session_remaining.saturating_sub(1),
            timestamp: Utc::now(),
        })
    }

    pub async fn history(&self, session_id: &str) -> Result<Option<ChatSession>, ReplyError> {
        self.load(session_id).await
    }

    /// Delete the chat record and its rate counters.
    pub async fn end_session(&self, session_id: &str) -> Result<bool, ReplyError> {
        let existed = self.store.delete(&ChatSession::store_key(session_id)).await?;
        self.limiter.reset(session_id).await?;
        Ok(existed)
    }
}

#[async_trait]
impl ReplyService for ChatService {
    async fn reply(&self, text: &str, session_id: &str) -> Result<Option<String>, ReplyError> {
        self.send_message(session_id, text).await.map(|r| r.reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::RateLimitScope;
    use crate::store::InMemorySessionStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoGenerator {
        calls: AtomicUsize,
        answer: bool,
    }

    #[async_trait]
    impl ReplyGenerator for EchoGenerator {
        async fn generate(
            &self,
            _session_id: &str,
            message: &str,
            _history: &[ChatMessage],
        ) -> anyhow::Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.then(|| format!("echo: {}", message)))
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl ReplyGenerator for FailingGenerator {
        async fn generate(&self, _: &str, _: &str, _: &[ChatMessage]) -> anyhow::Result<Option<String>> {
            Err(anyhow::anyhow!("upstream unavailable"))
        }
    }

    fn config(window_limit: u32) -> ChatConfig {
        ChatConfig {
            window_message_limit: window_limit,
            ..ChatConfig::default()
        }
    }

    fn service(answer: bool, window_limit: u32) -> (ChatService, Arc<EchoGenerator>) {
        let generator = Arc::new(EchoGenerator {
            calls: AtomicUsize::new(0),
            answer,
        });
        let service = ChatService::new(
            Arc::new(InMemorySessionStore::new()),
            generator.clone(),
            &config(window_limit),
        );
        (service, generator)
    }

    #[tokio::test]
    async fn test_send_message_persists_both_turns() {
        let (service, _) = service(true, 10);
        let reply = service.send_message("s1", "  hello  ").await.unwrap();

        assert_eq!(reply.reply.as_deref(), Some("echo: hello"));
        assert_eq!(reply.message_count, 2);
        assert_eq!(reply.window_remaining, 9);

        let history = service.history("s1").await.unwrap().unwrap();
        assert_eq!(history.messages.len(), 2);
        assert_eq!(history.messages[0].role, Role::User);
        assert_eq!(history.messages[0].content, "hello");
        assert_eq!(history.messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_declined_reply_persists_only_user_message() {
        let (service, _) = service(false, 10);
        let reply = service.reply("hello", "s1").await.unwrap();
        assert!(reply.is_none());

        let history = service.history("s1").await.unwrap().unwrap();
        assert_eq!(history.messages.len(), 1);
        assert_eq!(history.messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_rate_limited_message_is_not_persisted() {
        let (service, generator) = service(true, 1);
        service.send_message("s1", "first").await.unwrap();

        let err = service.reply("second", "s1").await.unwrap_err();
        match err {
            ReplyError::RateLimited {
                scope,
                remaining,
                reset_time,
                ..
            } => {
                assert_eq!(scope, RateLimitScope::Window);
                assert_eq!(remaining, 0);
                assert!(reset_time > Utc::now());
            }
            other => panic!("expected rate limit, got {:?}", other),
        }

        // Generator was not consulted and nothing new was stored
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        let history = service.history("s1").await.unwrap().unwrap();
        assert_eq!(history.messages.len(), 2);
        assert_eq!(history.messages[1].role, Role::Assistant);
        assert_eq!(history.messages[1].content, "echo: first");
    }

    #[tokio::test]
    async fn test_invalid_input_rejected() {
        let (service, generator) = service(true, 10);
        assert!(matches!(
            service.send_message("s1", "   ").await,
            Err(ReplyError::InvalidInput(_))
        ));

        let long = "x".repeat(ChatConfig::default().max_message_length + 1);
        assert!(matches!(
            service.send_message("s1", &long).await,
            Err(ReplyError::InvalidInput(_))
        ));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_generation_failure_persists_nothing() {
        let service = ChatService::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(FailingGenerator),
            &config(10),
        );

        assert!(matches!(
            service.send_message("s1", "hello").await,
            Err(ReplyError::Generation(_))
        ));
        let history = service.history("s1").await.unwrap().unwrap();
        assert!(history.messages.is_empty());
    }

    #[tokio::test]
    async fn test_end_session_removes_record_and_counters() {
        let (service, _) = service(true, 1);
        service.send_message("s1", "hello").await.unwrap();

        assert!(service.end_session("s1").await.unwrap());
        assert!(service.history("s1").await.unwrap().is_none());
        assert!(!service.end_session("s1").await.unwrap());

        // Counters were reset along with the record
        assert!(service.send_message("s1", "again").await.is_ok());
    }
}
