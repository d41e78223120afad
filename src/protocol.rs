//! # Voice Connection Protocol
//!
//! JSON text frames tagged by `type`. Binary frames carry raw PCM and are
//! treated as `audio_data` without a JSON envelope.
//!
//! ## Client → Server:
//! - `session_init` - associate the connection with a session (and format)
//! - `audio_data` - base64 PCM chunk
//! - `start_streaming` / `stop_streaming` - speaking turn boundaries
//! - `ping` - liveness probe
//!
//! ## Server → Client:
//! - `connection_established`, `streaming_started`, `streaming_stopped` - acks
//! - `audio_received` - chunk accepted, no transcript yet
//! - `transcription` - recognized text and confidence
//! - `audio_response` - base64 synthesized reply audio
//! - `pong` - liveness reply
//! - `error` - recoverable failure notice
//!
//! Unknown message types are logged and ignored.

use crate::audio::format::AudioFormat;
use crate::services::ReplyError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

mod base64_payload {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.trim())
            .map_err(serde::de::Error::custom)
    }
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SessionInit {
        #[serde(default)]
        session_id: Option<String>,
        /// Capture format for subsequent audio; the session default otherwise
        #[serde(default)]
        audio_format: Option<AudioFormat>,
    },
    AudioData {
        #[serde(with = "base64_payload")]
        data: Vec<u8>,
    },
    StartStreaming,
    StopStreaming,
    Ping {
        #[serde(default)]
        timestamp: Option<u64>,
    },
}

const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "session_init",
    "audio_data",
    "start_streaming",
    "stop_streaming",
    "ping",
];

/// A text frame that could not be understood.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    InvalidJson(String),
    MissingType,
    InvalidPayload { message_type: String, reason: String },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidJson(msg) => write!(f, "Invalid JSON: {}", msg),
            ProtocolError::MissingType => write!(f, "Message has no 'type' field"),
            ProtocolError::InvalidPayload { message_type, reason } => {
                write!(f, "Invalid '{}' message: {}", message_type, reason)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Parse a text frame.
///
/// ## Returns:
/// - `Ok(Some(msg))` for a known message type
/// - `Ok(None)` for a well-formed message of an unknown type
pub fn parse_client_message(text: &str) -> Result<Option<ClientMessage>, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let message_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !CLIENT_MESSAGE_TYPES.contains(&message_type.as_str()) {
        tracing::debug!(message_type = %message_type, "Ignoring unknown message type");
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| ProtocolError::InvalidPayload {
            message_type,
            reason: e.to_string(),
        })
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        session_id: String,
        timestamp: u64,
    },
    StreamingStarted {
        session_id: String,
        timestamp: u64,
    },
    StreamingStopped {
        session_id: String,
        timestamp: u64,
    },
    AudioReceived {
        bytes: usize,
        pending_duration_ms: f64,
        timestamp: u64,
    },
    Transcription {
        transcript: String,
        confidence: f32,
        timestamp: u64,
    },
    AudioResponse {
        #[serde(with = "base64_payload")]
        audio: Vec<u8>,
        format: AudioFormat,
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remaining: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reset_time: Option<DateTime<Utc>>,
        timestamp: u64,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code.to_string()),
            remaining: None,
            reset_time: None,
            timestamp: now_millis(),
        }
    }

    /// Error frame for a failed reply; rate limits carry their allowance.
    pub fn reply_error(err: &ReplyError) -> Self {
        match err {
            ReplyError::RateLimited {
                remaining,
                reset_time,
                ..
            } => ServerMessage::Error {
                message: err.to_string(),
                code: Some("rate_limit_exceeded".to_string()),
                remaining: Some(*remaining),
                reset_time: Some(*reset_time),
                timestamp: now_millis(),
            },
            _ => Self::error("reply_failed", err.to_string()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::ConnectionEstablished { .. } => "connection_established",
            ServerMessage::StreamingStarted { .. } => "streaming_started",
            ServerMessage::StreamingStopped { .. } => "streaming_stopped",
            ServerMessage::AudioReceived { .. } => "audio_received",
            ServerMessage::Transcription { .. } => "transcription",
            ServerMessage::AudioResponse { .. } => "audio_response",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::RateLimitScope;

    #[test]
    fn test_parse_known_messages() {
        let msg = parse_client_message(r#"{"type":"session_init","session_id":"abc"}"#).unwrap();
        assert_eq!(
            msg,
            Some(ClientMessage::SessionInit {
                session_id: Some("abc".to_string()),
                audio_format: None,
            })
        );

        let msg = parse_client_message(r#"{"type":"audio_data","data":"AQIDBA=="}"#).unwrap();
        assert_eq!(msg, Some(ClientMessage::AudioData { data: vec![1, 2, 3, 4] }));

        let msg = parse_client_message(r#"{"type":"ping","timestamp":42}"#).unwrap();
        assert_eq!(msg, Some(ClientMessage::Ping { timestamp: Some(42) }));

        let msg = parse_client_message(r#"{"type":"stop_streaming"}"#).unwrap();
        assert_eq!(msg, Some(ClientMessage::StopStreaming));
    }

    #[test]
    fn test_session_init_with_format() {
        let text = r#"{"type":"session_init","session_id":"s","audio_format":
            {"sample_rate":48000,"channels":2,"bit_depth":16,"encoding":"pcm16_le"}}"#;
        match parse_client_message(text).unwrap() {
            Some(ClientMessage::SessionInit { audio_format: Some(format), .. }) => {
                assert_eq!(format, AudioFormat::pcm16(48000, 2));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        assert_eq!(parse_client_message(r#"{"type":"dance","speed":3}"#).unwrap(), None);
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(matches!(
            parse_client_message("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(
            parse_client_message(r#"{"data":"x"}"#),
            Err(ProtocolError::MissingType)
        );
        assert!(matches!(
            parse_client_message(r#"{"type":"audio_data","data":"%%%"}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_server_message_tags() {
        let json = serde_json::to_value(ServerMessage::Pong { timestamp: 7 }).unwrap();
        assert_eq!(json["type"], "pong");
        assert_eq!(json["timestamp"], 7);

        let json = serde_json::to_value(ServerMessage::AudioResponse {
            audio: vec![1, 2, 3, 4],
            format: AudioFormat::pcm16(24000, 1),
            timestamp: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "audio_response");
        assert_eq!(json["audio"], "AQIDBA==");
    }

    #[test]
    fn test_rate_limit_error_frame() {
        let reset_time = Utc::now() + chrono::Duration::seconds(30);
        let frame = ServerMessage::reply_error(&ReplyError::RateLimited {
            scope: RateLimitScope::Window,
            limit: 10,
            remaining: 0,
            reset_time,
        });

        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "rate_limit_exceeded");
        assert_eq!(json["remaining"], 0);
        assert!(json["reset_time"].is_string());

        let plain = serde_json::to_value(ServerMessage::error("bad", "oops")).unwrap();
        assert!(plain.get("remaining").is_none());
    }
}
