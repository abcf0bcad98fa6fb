//! Axum Handlers for the HTTP API
//!
//! The gateway event endpoint, the call setup document, session inspection,
//! and liveness. `utoipa` doc comments generate the OpenAPI document.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use quick_xml::escape::escape;
use std::sync::Arc;
use tracing::{debug, error};

use crate::{
    models::{ErrorResponse, HealthResponse, SessionRecord},
    relay::protocol::{Ack, RelayEvent},
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Handle one relay event forwarded by an external WebSocket gateway.
///
/// The HTTP status mirrors the acknowledgement's `statusCode`.
#[utoipa::path(
    post,
    path = "/events",
    request_body = RelayEvent,
    responses(
        (status = 200, description = "Event handled", body = Ack),
        (status = 500, description = "Event could not be addressed", body = Ack)
    )
)]
pub async fn post_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<RelayEvent>,
) -> impl IntoResponse {
    let ack = state.orchestrator.handle(&event).await;
    let status = StatusCode::from_u16(ack.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ack))
}

/// Builds the ConversationRelay setup document.
pub fn conversation_relay_twiml(ws_url: &str, welcome_greeting: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><ConversationRelay url="{}" welcomeGreeting="{}" /></Connect></Response>"#,
        escape(ws_url),
        escape(welcome_greeting)
    )
}

/// Tell the telephony platform where to open the relay socket for a new call.
#[utoipa::path(
    post,
    path = "/twiml",
    responses(
        (status = 200, description = "Call setup document", content_type = "text/xml", body = String),
        (status = 400, description = "No public URL configured and no Host header", body = ErrorResponse)
    )
)]
pub async fn twiml(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let ws_url = match &state.config.public_ws_url {
        Some(url) => url.clone(),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ApiError::BadRequest("Host header is required".to_string()))?;
            format!("wss://{}/ws", host)
        }
    };
    debug!(%ws_url, "Serving call setup document");

    let body = conversation_relay_twiml(&ws_url, &state.config.welcome_greeting);
    Ok(([(header::CONTENT_TYPE, "text/xml")], body))
}

/// Get the stored conversation for a call.
#[utoipa::path(
    get,
    path = "/sessions/{call_sid}",
    responses(
        (status = 200, description = "Stored conversation", body = SessionRecord),
        (status = 404, description = "No live session for this call", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("call_sid" = String, Path, description = "Call identifier the session is keyed by")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(call_sid): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    let conversation = state
        .store
        .load(&call_sid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No session for call {}", call_sid)))?;

    Ok(Json(SessionRecord {
        call_sid,
        conversation,
    }))
}

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        open_connections: state.registry.len().await,
    })
}
