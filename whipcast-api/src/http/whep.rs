//! WHEP egress endpoint

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::post,
    Router,
};
use whipcast_sfu::{SessionDescription, StreamId};

use crate::http::{sdp_created, AppResult, AppState};

pub fn create_whep_router() -> Router<AppState> {
    Router::new().route("/whep/{stream_id}", post(subscribe))
}

/// Subscribe to a published stream
///
/// Path: `POST /whep/{stream_id}`, body: SDP offer. `404` if nothing is
/// published under `stream_id`.
pub async fn subscribe(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    body: String,
) -> AppResult<impl IntoResponse> {
    let stream_id = StreamId::parse(stream_id)?;
    let offer = SessionDescription::offer(body)?;

    let answer = state.relay.subscribe(stream_id, offer).await?;
    Ok(sdp_created(answer))
}
