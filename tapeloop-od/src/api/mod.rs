//! HTTP operational surface
//!
//! Handlers never touch the track store directly: every request becomes an
//! event on the orchestrator handle, so HTTP callers are serialized with
//! everything else.

pub mod control;
pub mod health;

pub use control::{control_routes, track_routes};
pub use health::health_routes;

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::orchestrator::OrchestratorHandle;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub handle: OrchestratorHandle,
    /// Folder names tried on a device attached through `POST /devices`
    pub music_folder_names: Arc<Vec<String>>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(handle: OrchestratorHandle, music_folder_names: Vec<String>) -> Self {
        Self {
            handle,
            music_folder_names: Arc::new(music_folder_names),
            startup_time: Utc::now(),
        }
    }
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(control_routes())
        .merge(track_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
