//! HTTP request handlers

use super::types::{ErrorResponse, WebhookResponse};
use super::AppState;
use crate::telegram::Update;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/:bot/:secret", post(receive_update))
        .route("/version", get(get_version))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================
// Webhook
// ============================================================

async fn receive_update(
    State(state): State<AppState>,
    Path((bot, secret)): Path<(String, String)>,
    Json(update): Json<Update>,
) -> Result<Json<WebhookResponse>, AppError> {
    if !state.authenticates(&bot, &secret) {
        tracing::warn!(bot = %bot, "Rejected webhook call with bad credentials");
        return Err(AppError::Unauthorized);
    }

    let Some(chat_id) = update.chat_id() else {
        tracing::info!(update_id = update.update_id, "Update without a chat, skipping");
        return Ok(Json(WebhookResponse::accepted()));
    };

    let interpreter = Arc::clone(&state.interpreter);
    let key = interpreter.session_key(chat_id);
    tracing::debug!(
        session = %key,
        update_id = update.update_id,
        sessions = interpreter.sessions().len(),
        lanes = state.serializer.lanes(),
        "Queueing update"
    );
    // Failures are logged by the lane; the platform only needs an ack
    drop(state.serializer.enqueue(key, async move {
        interpreter.handle_update(&update).await
    }));

    Ok(Json(WebhookResponse::accepted()))
}

// ============================================================
// Version
// ============================================================

async fn get_version() -> &'static str {
    concat!("chatflow ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

enum AppError {
    Unauthorized,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unknown bot or secret"),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
