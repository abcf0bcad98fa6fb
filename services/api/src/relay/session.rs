//! Terminates the telephony relay's WebSocket in-process.
//!
//! Each socket gets a fresh connection id and an outbound queue in the
//! [`ConnectionRegistry`](super::channel::ConnectionRegistry). The read loop
//! turns socket lifecycle steps and text frames into [`RelayEvent`]s and hands
//! them to the orchestrator one at a time, so events for a socket are handled
//! in arrival order. A separate writer task drains the outbound queue.

use super::protocol::{OutboundMessage, RelayEvent, RouteKey};
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

#[instrument(name = "relay_socket", skip_all, fields(connection_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4().to_string();
    tracing::Span::current().record("connection_id", connection_id.as_str());

    let (socket_tx, mut socket_rx) = socket.split();
    let outbound = state.registry.register(&connection_id).await;
    let writer = tokio::spawn(forward_outbound(socket_tx, outbound).in_current_span());

    dispatch(&state, &connection_id, RouteKey::Connect, None).await;

    while let Some(msg_result) = socket_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                dispatch(
                    &state,
                    &connection_id,
                    RouteKey::Default,
                    Some(text.as_str().to_owned()),
                )
                .await;
            }
            Ok(Message::Binary(_)) => warn!("Ignoring binary frame from relay"),
            Ok(Message::Close(_)) => {
                info!("Relay sent close frame");
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                warn!(error = ?e, "Error receiving from relay socket");
                break;
            }
        }
    }

    dispatch(&state, &connection_id, RouteKey::Disconnect, None).await;

    // Dropping the registry's sender ends the writer once the queue is drained.
    state.registry.unregister(&connection_id).await;
    if let Err(e) = writer.await {
        error!(error = ?e, "Relay writer task failed");
    }
    info!("Relay connection closed");
}

async fn dispatch(state: &AppState, connection_id: &str, route: RouteKey, body: Option<String>) {
    let event = RelayEvent::local(connection_id, route, body);
    let ack = state.orchestrator.handle(&event).await;
    if !ack.is_ok() {
        warn!(status = ack.status_code, body = ?ack.body, "Relay event was not accepted");
    }
}

async fn forward_outbound(
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundMessage>,
) {
    while let Some(msg) = outbound.recv().await {
        if let Err(e) = send_msg(&mut socket_tx, &msg).await {
            warn!(error = ?e, "Failed to write to relay socket; dropping remaining output");
            return;
        }
    }
    debug!("Outbound queue closed");
    let _ = socket_tx.close().await;
}

/// Serializes an `OutboundMessage` and writes it as a text frame.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: &OutboundMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
