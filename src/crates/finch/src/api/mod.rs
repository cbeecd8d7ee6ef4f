//! HTTP boundary
//!
//! Thread lifecycle, the SSE run endpoint, and the tool-approval endpoint.
//! The run endpoint spawns a producer task that executes the graph and
//! feeds a bounded event queue; the handler's stream drains the queue to
//! the socket. If the client goes away the producer keeps running so the
//! final checkpoint and the assistant row are still persisted.

pub mod auth;
mod routes;

use crate::context::AppContext;
use flow_core::Runner;
use std::sync::Arc;

pub use routes::router;

/// Shared handler state
pub struct AppState {
    pub ctx: Arc<AppContext>,
    pub runner: Arc<Runner>,
}

impl AppState {
    pub fn new(ctx: Arc<AppContext>, runner: Arc<Runner>) -> Arc<Self> {
        Arc::new(Self { ctx, runner })
    }
}
