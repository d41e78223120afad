use crate::audio::session::SessionError;
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};

/// GET /api/v1/voice/sessions
pub async fn list_voice_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(state.sessions.get_sessions_summary()))
}

/// GET /api/v1/voice/sessions/{session_id}
pub async fn get_voice_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let session = state
        .sessions
        .get_session(&session_id)
        .ok_or(SessionError::NotFound(session_id))?;

    Ok(HttpResponse::Ok().json(session.stats()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec;
    use crate::config::AppConfig;
    use crate::state::testing::test_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_session_endpoints() {
        let state = test_state(AppConfig::default());
        let session = state
            .sessions
            .create_session(Some("voice-1".to_string()))
            .unwrap();
        state
            .pipeline
            .ingest(&session, codec::create_test_tone(440.0, 100, 16000))
            .unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/voice/sessions", web::get().to(list_voice_sessions))
                .route("/voice/sessions/{session_id}", web::get().to(get_voice_session)),
        )
        .await;

        let req = test::TestRequest::get().uri("/voice/sessions").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total_sessions"], 1);

        let req = test::TestRequest::get().uri("/voice/sessions/voice-1").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session_id"], "voice-1");
        assert_eq!(body["buffer"]["chunk_count"], 1);
        assert_eq!(body["is_processing"], false);

        let req = test::TestRequest::get().uri("/voice/sessions/missing").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }
}
