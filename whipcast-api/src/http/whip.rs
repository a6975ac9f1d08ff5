//! WHIP ingest endpoints
//!
//! - `POST /whip/{stream_id}` - Publish a stream (body: SDP offer)
//! - `DELETE /whip/{stream_id}` - Stop publishing

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Router,
};
use whipcast_sfu::{SessionDescription, StreamId};

use crate::http::{sdp_created, AppResult, AppState};

pub fn create_whip_router() -> Router<AppState> {
    Router::new().route("/whip/{stream_id}", post(publish).delete(unpublish))
}

/// Start a publish session
///
/// Returns `201 Created` with `Location: /whip/{stream_id}` and the SDP
/// answer as body. A stream id that is already being published yields
/// `409 Conflict`.
pub async fn publish(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    body: String,
) -> AppResult<impl IntoResponse> {
    let stream_id = StreamId::parse(stream_id)?;
    let offer = SessionDescription::offer(body)?;

    let answer = state.relay.publish(stream_id, offer).await?;
    Ok(sdp_created(answer))
}

/// End a publish session and disconnect its subscribers
pub async fn unpublish(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let stream_id = StreamId::parse(stream_id)?;
    state.relay.unpublish(&stream_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
