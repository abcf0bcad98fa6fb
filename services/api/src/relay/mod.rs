//! Conversation Relay
//!
//! Everything between the telephony platform's relay socket and the reply
//! generator:
//!
//! - `protocol`: the event envelope, relay messages, and acknowledgements.
//! - `channel`: push delivery back to an open connection.
//! - `orchestrator`: the per-event state machine.
//! - `session`: the in-process WebSocket endpoint.

pub mod channel;
pub mod orchestrator;
pub mod protocol;
pub mod session;

pub use session::ws_handler;
