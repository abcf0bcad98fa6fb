//! The per-event relay state machine.
//!
//! Every inbound event is handled on its own. Nothing is kept in memory
//! between events; the transcript store is the only continuity a call has.
//! Failures are contained where they happen:
//!
//! - an unparsable body is logged and acknowledged;
//! - a backend failure is turned into an apology by the responder;
//! - a lost outbound fragment is logged at the sink;
//! - a store failure degrades to a fresh transcript on read and is logged on write.
//!
//! Only an event with no connection identifier at all is answered with an error.

use super::{
    channel::{RelayAddress, RelayChannel},
    protocol::{Ack, InboundMessage, OutboundMessage, RelayEvent, RouteKey},
};
use crate::store::Sessions;
use async_trait::async_trait;
use callrelay_core::responder::{FragmentSink, REPROMPT, Responder};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Event has no connection identifier; cannot address a reply")]
    Unaddressable,
}

/// Picks the session key for a message: the platform's call identifier when
/// present, otherwise the connection the message arrived on.
pub fn resolve_call_id(call_sid: Option<&str>, connection_id: &str) -> String {
    match call_sid.map(str::trim) {
        Some(sid) if !sid.is_empty() => sid.to_string(),
        _ => connection_id.to_string(),
    }
}

/// Drives one call's conversation, one event at a time.
pub struct Orchestrator {
    sessions: Sessions,
    responder: Arc<dyn Responder>,
    channel: Arc<dyn RelayChannel>,
}

impl Orchestrator {
    pub fn new(
        sessions: Sessions,
        responder: Arc<dyn Responder>,
        channel: Arc<dyn RelayChannel>,
    ) -> Self {
        Self {
            sessions,
            responder,
            channel,
        }
    }

    /// Handles one event and produces the acknowledgement for the transport.
    pub async fn handle(&self, event: &RelayEvent) -> Ack {
        match self.dispatch(event).await {
            Ok(()) => Ack::ok(),
            Err(e) => {
                error!(error = %e, "Relay event could not be handled");
                Ack::error(500, &e.to_string())
            }
        }
    }

    #[instrument(name = "relay_event", skip_all, fields(connection_id, route))]
    async fn dispatch(&self, event: &RelayEvent) -> Result<(), RelayError> {
        let context = &event.request_context;
        let connection_id = context
            .connection_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(RelayError::Unaddressable)?;

        let route = event.route();
        let span = tracing::Span::current();
        span.record("connection_id", connection_id);
        span.record("route", route.as_str());

        match route {
            RouteKey::Connect => info!("Client connected"),
            RouteKey::Disconnect => info!("Client disconnected"),
            RouteKey::Default => {
                let address = RelayAddress {
                    connection_id: connection_id.to_string(),
                    domain_name: context.domain_name.clone(),
                    stage: context.stage.clone(),
                };
                self.handle_message(event.body.as_deref(), &address).await;
            }
            RouteKey::Unknown(raw) => warn!(route = %raw, "Unhandled route; acknowledging"),
        }
        Ok(())
    }

    async fn handle_message(&self, body: Option<&str>, address: &RelayAddress) {
        let Some(body) = body.filter(|b| !b.trim().is_empty()) else {
            warn!("Data event arrived without a body");
            return;
        };

        let message: InboundMessage = match serde_json::from_str(body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, %body, "Could not parse relay message; ignoring");
                return;
            }
        };

        if message.call_sid().is_none() && !matches!(message, InboundMessage::Unknown) {
            warn!(
                kind = message.kind(),
                "Message has no callSid; keying session by connection"
            );
        }
        let call_id = resolve_call_id(message.call_sid(), &address.connection_id);

        match message {
            InboundMessage::Setup { from, to, .. } => {
                info!(call_sid = %call_id, ?from, ?to, "Call setup");
                self.handle_setup(&call_id).await;
            }
            InboundMessage::Prompt {
                voice_prompt,
                confidence,
                ..
            } => {
                info!(call_sid = %call_id, ?confidence, "Caller prompt received");
                self.handle_prompt(&call_id, voice_prompt, address).await;
            }
            InboundMessage::Interrupt { .. } => {
                // Replies already in flight are not cancelled.
                info!(call_sid = %call_id, "Caller interrupted; no action taken");
            }
            InboundMessage::Unknown => {
                info!("Unhandled relay message type; acknowledging");
            }
        }
    }

    async fn handle_setup(&self, call_id: &str) {
        if let Err(e) = self.sessions.put(call_id, &self.sessions.fresh()).await {
            error!(call_sid = %call_id, error = %e, "Failed to store new session");
        }
    }

    async fn handle_prompt(
        &self,
        call_id: &str,
        voice_prompt: Option<String>,
        address: &RelayAddress,
    ) {
        let prompt = match voice_prompt {
            Some(text) if !text.trim().is_empty() => text,
            _ => {
                debug!(call_sid = %call_id, "Empty prompt; asking caller to repeat");
                REPROMPT.to_string()
            }
        };

        let mut transcript = self.sessions.get(call_id).await;
        transcript.push_user(prompt);

        let sink = ChannelSink::new(self.channel.as_ref(), address);
        let reply = self.responder.respond(&transcript, &sink).await;
        transcript.push_assistant(reply);

        // Saved even when delivery failed, so the next prompt keeps its context.
        match self.sessions.put(call_id, &transcript).await {
            Ok(()) => debug!(call_sid = %call_id, turns = transcript.len(), "Transcript saved"),
            Err(e) => error!(call_sid = %call_id, error = %e, "Failed to save transcript"),
        }

        let (sent, failed) = sink.counts();
        if failed > 0 {
            warn!(call_sid = %call_id, sent, failed, "Reply was only partly delivered");
        }
    }
}

/// Forwards reply fragments to the caller's connection, logging and counting
/// any that cannot be delivered.
struct ChannelSink<'a> {
    channel: &'a dyn RelayChannel,
    address: &'a RelayAddress,
    sent: AtomicUsize,
    failed: AtomicUsize,
}

impl<'a> ChannelSink<'a> {
    fn new(channel: &'a dyn RelayChannel, address: &'a RelayAddress) -> Self {
        Self {
            channel,
            address,
            sent: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    fn counts(&self) -> (usize, usize) {
        (
            self.sent.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl<'a> FragmentSink for ChannelSink<'a> {
    async fn emit(&self, token: &str, last: bool) {
        let message = OutboundMessage::text(token, last);
        match self.channel.send(self.address, &message).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    connection_id = %self.address.connection_id,
                    last,
                    error = %e,
                    "Error sending message to client"
                );
            }
        }
    }
}
