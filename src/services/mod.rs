//! # External Service Contracts
//!
//! The voice pipeline treats recognition, reply generation and synthesis as
//! opaque services. This module defines their contracts; `http` provides
//! implementations that talk to them over HTTP.
//!
//! ## Contracts:
//! - **SpeechRecognizer**: 16kHz mono PCM16 in, transcript + confidence out
//! - **ReplyGenerator**: user text + history in, reply text (or nothing) out
//! - **SpeechSynthesizer**: reply text in, audio + its format out
//! - **ReplyService**: the session-aware reply contract the pipeline calls,
//!   including rate limiting (implemented by `chat::ChatService`)

pub mod http;

use crate::audio::format::AudioFormat;
use crate::chat::history::ChatMessage;
use crate::store::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Recognized text for one processing window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub text: String,
    /// Confidence score (0.0 to 1.0)
    pub confidence: f32,
}

impl Transcript {
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Audio produced by the synthesis service.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub data: Vec<u8>,
    pub format: AudioFormat,
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe 16kHz mono 16-bit little-endian PCM.
    async fn transcribe(&self, pcm: &[u8], format: &AudioFormat) -> anyhow::Result<Transcript>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> anyhow::Result<SynthesizedAudio>;
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Generate a reply to `message` given the prior conversation.
    ///
    /// `Ok(None)` means the generator chose not to answer.
    async fn generate(
        &self,
        session_id: &str,
        message: &str,
        history: &[ChatMessage],
    ) -> anyhow::Result<Option<String>>;
}

/// Which rate window was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// Short sliding window
    Window,
    /// Lifetime cap for the session
    Session,
}

/// Failures of the session-aware reply contract.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyError {
    /// A message cap was hit; nothing was persisted
    RateLimited {
        scope: RateLimitScope,
        limit: u32,
        remaining: u32,
        reset_time: DateTime<Utc>,
    },
    /// Blank or oversized input
    InvalidInput(String),
    /// The generator failed
    Generation(String),
    /// The session store failed
    Store(StoreError),
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyError::RateLimited { scope, limit, reset_time, .. } => write!(
                f,
                "Rate limit exceeded ({} messages per {}), resets at {}",
                limit,
                match scope {
                    RateLimitScope::Window => "window",
                    RateLimitScope::Session => "session",
                },
                reset_time.to_rfc3339()
            ),
            ReplyError::InvalidInput(msg) => write!(f, "Invalid message: {}", msg),
            ReplyError::Generation(msg) => write!(f, "Reply generation failed: {}", msg),
            ReplyError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ReplyError {}

impl From<StoreError> for ReplyError {
    fn from(err: StoreError) -> Self {
        ReplyError::Store(err)
    }
}

/// Session-aware reply generation used by the voice pipeline.
#[async_trait]
pub trait ReplyService: Send + Sync {
    async fn reply(&self, text: &str, session_id: &str) -> Result<Option<String>, ReplyError>;
}

/// Estimate a confidence score when the recognizer doesn't report one.
///
/// ## Heuristic Approach:
/// Scores speaking pace, common words, capitalization and punctuation, and
/// penalizes obviously garbled output.
pub fn estimate_confidence(text: &str, audio_duration_secs: f64) -> f32 {
    if text.trim().is_empty() {
        return 0.0;
    }

    let mut confidence = 0.5f32;

    // Reasonable speaking pace
    if audio_duration_secs > 0.0 {
        let chars_per_second = text.len() as f64 / audio_duration_secs;
        if chars_per_second > 10.0 && chars_per_second < 100.0 {
            confidence += 0.2;
        } else {
            confidence -= 0.1;
        }
    }

    let common_words = ["the", "and", "to", "of", "a", "in", "is", "it", "you", "that"];
    let text_lower = text.to_lowercase();
    let common_word_count = common_words
        .iter()
        .filter(|&&word| text_lower.split_whitespace().any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == word))
        .count();
    confidence += 0.1 * (common_word_count as f32 / common_words.len() as f32);

    if text.chars().next().is_some_and(|c| c.is_uppercase()) {
        confidence += 0.1;
    }

    if text.contains("...") || text.contains("???") {
        confidence -= 0.2;
    } else if text.ends_with(['.', '?', '!']) {
        confidence += 0.1;
    }

    confidence.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_estimation() {
        assert!(estimate_confidence("Hello, how are you today?", 2.0) > 0.5);
        assert_eq!(estimate_confidence("   ", 2.0), 0.0);
        assert!(estimate_confidence("asdkjhasd... ???", 2.0) < 0.5);
    }

    #[test]
    fn test_rate_limit_error_display() {
        let err = ReplyError::RateLimited {
            scope: RateLimitScope::Window,
            limit: 10,
            remaining: 0,
            reset_time: Utc::now(),
        };
        assert!(err.to_string().contains("10 messages per window"));
    }
}
