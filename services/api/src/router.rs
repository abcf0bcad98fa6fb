//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the relay endpoints, session inspection, and OpenAPI documentation.

use crate::{
    handlers,
    models::{ErrorResponse, HealthResponse, SessionRecord},
    relay::{
        protocol::{Ack, OutboundMessage, RelayEvent, RequestContext},
        ws_handler,
    },
    state::AppState,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::post_event,
        handlers::twiml,
        handlers::get_session,
        handlers::health,
    ),
    components(
        schemas(RelayEvent, RequestContext, Ack, OutboundMessage, SessionRecord, HealthResponse, ErrorResponse)
    ),
    tags(
        (name = "Call Relay API", description = "Voice call relay between a telephony platform and a chat model")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/events", post(handlers::post_event))
        .route("/twiml", post(handlers::twiml))
        .route("/sessions/{call_sid}", get(handlers::get_session))
        .route("/health", get(handlers::health))
        .route("/ws", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
