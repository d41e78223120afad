//! # Text Chat
//!
//! Chat sessions shared by the HTTP chat endpoints and the voice pipeline.
//! A session's history and rate counters live in the session store, so a
//! conversation can move between voice and text under the same id.
//!
//! ## Key Components:
//! - **History**: persisted chat-session records
//! - **RateLimit**: short-window and lifetime message caps
//! - **Service**: `ChatService`, the `ReplyService` the pipeline calls

pub mod history;
pub mod rate_limit;
pub mod service;

pub use service::ChatService;
