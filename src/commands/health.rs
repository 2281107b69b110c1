use crate::feed::types::ConnectionState;
use crate::state::AppState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub connection: ConnectionState,
}

pub fn build_health_response(started_at: Instant, connection: ConnectionState) -> HealthResponse {
    let status = match connection {
        ConnectionState::Connected => "ok",
        ConnectionState::Connecting | ConnectionState::Disconnected => "degraded",
        ConnectionState::Errored => "error",
    };

    HealthResponse {
        status,
        uptime_ms: started_at.elapsed().as_millis(),
        connection,
    }
}

pub fn health(state: &AppState) -> HealthResponse {
    build_health_response(state.started_at, state.feed.connection_state())
}
