//! Call Relay API Library Crate
//!
//! This library contains the web service side of the call relay: configuration,
//! session storage, the relay protocol and orchestrator, HTTP handlers, and
//! routing. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod relay;
pub mod router;
pub mod state;
pub mod store;
