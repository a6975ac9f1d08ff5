//! Monitoring endpoints
//!
//! - `/health` - Liveness check
//! - `/api/streams` - Active streams with forwarding statistics

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use whipcast_sfu::StreamInfo;

use crate::http::AppState;

/// Response for the stream listing
#[derive(Debug, Serialize, Deserialize)]
pub struct ListStreamsResponse {
    pub streams: Vec<StreamInfo>,
    pub total: usize,
}

pub fn create_monitor_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/streams", get(list_streams))
}

/// Always `OK` while the server is accepting requests
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Path: `GET /api/streams`
pub async fn list_streams(State(state): State<AppState>) -> Json<ListStreamsResponse> {
    let streams = state.relay.streams();
    Json(ListStreamsResponse {
        total: streams.len(),
        streams,
    })
}
