//! Per-session message caps backed by expiring store counters.
//!
//! Two counters per session: a short window (`ratelimit:window:{id}`) and a
//! lifetime cap (`ratelimit:session:{id}`). Checks read before they write, so
//! concurrent senders may overshoot a cap slightly.

use crate::services::{RateLimitScope, ReplyError};
use crate::store::SessionStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitPolicy {
    pub window_limit: u32,
    pub window: Duration,
    pub session_limit: u32,
    pub session_ttl: Duration,
}

/// Remaining allowance after a successful check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub window_remaining: u32,
    pub session_remaining: u32,
}

pub struct RateLimiter {
    store: Arc<dyn SessionStore>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SessionStore>, policy: RateLimitPolicy) -> Self {
        Self { store, policy }
    }

    fn window_key(session_id: &str) -> String {
        format!("ratelimit:window:{}", session_id)
    }

    fn session_key(session_id: &str) -> String {
        format!("ratelimit:session:{}", session_id)
    }

    async fn count(&self, key: &str) -> Result<u32, ReplyError> {
        let value = self.store.get(key).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Refresh the lifetime counter's TTL. Called when a chat session is created.
    pub async fn refresh(&self, session_id: &str) -> Result<(), ReplyError> {
        let key = Self::session_key(session_id);
        if !self.store.expire(&key, self.policy.session_ttl).await? {
            self.store
                .set(&key, "0".to_string(), Some(self.policy.session_ttl))
                .await?;
        }
        Ok(())
    }

    /// Check both caps without consuming anything.
    pub async fn check(&self, session_id: &str) -> Result<RateLimitStatus, ReplyError> {
        let window_key = Self::window_key(session_id);
        let window_used = self.count(&window_key).await?;
        if window_used >= self.policy.window_limit {
            let ttl = self.store.ttl(&window_key).await?.unwrap_or(self.policy.window);
            return Err(self.exceeded(RateLimitScope::Window, self.policy.window_limit, ttl));
        }

        let session_key = Self::session_key(session_id);
        let session_used = self.count(&session_key).await?;
        if session_used >= self.policy.session_limit {
            let ttl = self
                .store
                .ttl(&session_key)
                .await?
                .unwrap_or(self.policy.session_ttl);
            return Err(self.exceeded(RateLimitScope::Session, self.policy.session_limit, ttl));
        }

        Ok(RateLimitStatus {
            window_remaining: self.policy.window_limit - window_used,
            session_remaining: self.policy.session_limit - session_used,
        })
    }

    /// Count one accepted message against both caps.
    pub async fn record(&self, session_id: &str) -> Result<(), ReplyError> {
        let window_key = Self::window_key(session_id);
        if self.store.incr(&window_key).await? == 1 {
            self.store.expire(&window_key, self.policy.window).await?;
        }

        let session_key = Self::session_key(session_id);
        if self.store.incr(&session_key).await? == 1 {
            self.store.expire(&session_key, self.policy.session_ttl).await?;
        }
        Ok(())
    }

    /// Forget both counters.
    pub async fn reset(&self, session_id: &str) -> Result<(), ReplyError> {
        self.store.delete(&Self::window_key(session_id)).await?;
        self.store.delete(&Self::session_key(session_id)).await?;
        Ok(())
    }

    fn exceeded(&self, scope: RateLimitScope, limit: u32, ttl: Duration) -> ReplyError {
        // A zero TTL would report "now"; round up to one second
        let ttl = ttl.max(Duration::from_secs(1));
        let reset_time = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(1));

        ReplyError::RateLimited {
            scope,
            limit,
            remaining: 0,
            reset_time,
        }
    }
}
