//! # Error Handling
//!
//! HTTP-facing error type and its conversions from the domain errors.
//!
//! ## Error Categories:
//! - **Internal / ConfigError / Upstream**: server-side problems (500, 502)
//! - **BadRequest / ValidationError**: client sent invalid data (400)
//! - **NotFound**: requested session doesn't exist (404)
//! - **RateLimited**: a chat message cap was reached (429)
//! - **Unavailable**: capacity exhausted (503)
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "rate_limited",
//!     "message": "Rate limit exceeded (10 messages per window), resets at ...",
//!     "timestamp": "2025-01-01T12:00:00Z",
//!     "remaining": 0,
//!     "reset_time": "2025-01-01T12:01:00Z"
//!   }
//! }
//! ```

use crate::audio::format::AudioError;
use crate::audio::session::SessionError;
use crate::services::ReplyError;
use crate::store::StoreError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// A message cap was reached
    RateLimited {
        message: String,
        remaining: u32,
        reset_time: DateTime<Utc>,
    },

    /// An external service failed
    Upstream(String),

    /// No capacity for another session
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::RateLimited { message, .. } => write!(f, "Rate limited: {}", message),
            AppError::Upstream(msg) => write!(f, "Upstream service error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            AppError::RateLimited { message, .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited", message.clone()),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg.clone()),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        let mut body = json!({
            "type": error_type,
            "message": message,
            "timestamp": Utc::now().to_rfc3339()
        });

        if let AppError::RateLimited {
            remaining,
            reset_time,
            ..
        } = self
        {
            body["remaining"] = json!(remaining);
            body["reset_time"] = json!(reset_time.to_rfc3339());
        }

        HttpResponse::build(status).json(json!({ "error": body }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<AudioError> for AppError {
    fn from(err: AudioError) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => AppError::NotFound(format!("Voice session '{}'", id)),
            SessionError::LimitReached(_) => AppError::Unavailable(err.to_string()),
            SessionError::Audio(audio) => audio.into(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<ReplyError> for AppError {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::RateLimited {
                remaining,
                reset_time,
                ..
            } => AppError::RateLimited {
                message: err.to_string(),
                remaining,
                reset_time,
            },
            ReplyError::InvalidInput(msg) => AppError::ValidationError(msg),
            ReplyError::Generation(msg) => AppError::Upstream(msg),
            ReplyError::Store(store) => store.into(),
        }
    }
}
