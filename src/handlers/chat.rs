//! Text chat endpoints. They share session ids, history and rate windows
//! with the voice pipeline.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Continue an existing conversation; a new id is generated when absent
    pub session_id: Option<String>,
}

/// POST /api/v1/chat
/// Body: {"message": "Hello", "session_id": "optional"}
pub async fn send_chat_message(
    state: web::Data<AppState>,
    body: web::Json<ChatRequest>,
) -> Result<HttpResponse, AppError> {
    let ChatRequest { message, session_id } = body.into_inner();
    let session_id = session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let reply = state.chat.send_message(&session_id, &message).await?;
    Ok(HttpResponse::Ok().json(reply))
}

/// GET /api/v1/chat/{session_id}
pub async fn get_chat_history(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    match state.chat.history(&session_id).await? {
        Some(session) => Ok(HttpResponse::Ok().json(session)),
        None => Err(AppError::NotFound(format!("Chat session '{}'", session_id))),
    }
}

/// DELETE /api/v1/chat/{session_id}
pub async fn end_chat_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    if !state.chat.end_session(&session_id).await? {
        return Err(AppError::NotFound(format!("Chat session '{}'", session_id)));
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "ended",
        "session_id": session_id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}
