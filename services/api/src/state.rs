//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared handles
//! every request needs: the orchestrator, the local connection registry, and
//! the session store.

use crate::{
    config::Config,
    relay::{channel::ConnectionRegistry, orchestrator::Orchestrator},
    store::SessionStore,
};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<ConnectionRegistry>,
    pub store: Arc<dyn SessionStore>,
    pub config: Arc<Config>,
}
