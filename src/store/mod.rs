//! # Session / Rate-Limit Store
//!
//! Key-value store with expiring entries, holding chat histories and the
//! counters behind per-session rate windows. The voice pipeline and the text
//! chat endpoints share one store instance.
//!
//! ## Semantics:
//! - Reads followed by writes are advisory; concurrent writers may overshoot
//!   a counter slightly (soft limits)
//! - Expired keys behave exactly like missing keys

pub mod memory;

pub use memory::InMemorySessionStore;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Store failures.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Stored value has the wrong shape for the operation (e.g. `incr` on text)
    InvalidValue(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidValue(msg) => write!(f, "Invalid stored value: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Expiring key-value store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Value for a live key.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a value, replacing any existing one. `None` means no expiry.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Increment an integer counter, creating it at 1. Existing expiry is kept.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Set the expiry of a live key. Returns false if the key doesn't exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining lifetime of a live key with an expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Drop every expired entry, returning how many were removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}
