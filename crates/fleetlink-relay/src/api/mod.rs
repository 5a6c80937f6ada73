//! HTTP/WebSocket surface of the relay.

pub mod auth;
pub mod device;
pub mod error;
pub mod management;

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use fleetlink_core::Config;

use crate::bus::SharedBus;
use crate::presence::PresenceTracker;
use crate::session::SessionManager;
use crate::store::RelayStore;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: RelayStore,
    pub bus: SharedBus,
    pub presence: PresenceTracker,
    pub sessions: SessionManager,
    pub config: Config,
}

impl AppState {
    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.config.sessions.ping_period_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.config.sessions.open_timeout_secs)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.config.sessions.control_timeout_secs)
    }
}

/// Assemble the relay router: the device-facing stream endpoint, the
/// management surface, and health probes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health/alive", get(alive))
        .route("/api/health/ready", get(ready))
        .route("/api/devices/connect", get(device::connect))
        .route("/api/devices/{id}", get(management::device_state))
        .route("/api/devices/{id}/check-update", post(management::check_update))
        .route("/api/devices/{id}/send-inventory", post(management::send_inventory))
        .route("/api/devices/{id}/connect", get(management::connect))
        .route("/api/devices/{id}/download", get(management::download))
        .route("/api/devices/{id}/upload", put(management::upload))
        .route("/api/sessions/{id}/playback", get(management::playback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn alive() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn ready(State(state): State<AppState>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(state.store.pool()).await {
        Ok(_) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
