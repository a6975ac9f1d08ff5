// Module: http
// WHIP/WHEP signaling over plain HTTP, plus monitoring and static assets

pub mod error;
pub mod monitor;
pub mod whep;
pub mod whip;

use axum::{
    http::{
        header::{CONTENT_TYPE, LOCATION},
        StatusCode,
    },
    response::IntoResponse,
    Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use whipcast_sfu::{Answer, Relay};

pub use error::{AppError, AppResult};

/// Content type of offer and answer bodies
pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
}

/// `201 Created` carrying a session answer
pub(crate) fn sdp_created(answer: Answer) -> impl IntoResponse {
    (
        StatusCode::CREATED,
        [(LOCATION, answer.location), (CONTENT_TYPE, SDP_CONTENT_TYPE.to_string())],
        answer.sdp,
    )
}

/// Create the HTTP router with all routes
///
/// Requests that match no route are served from `static_dir` when given.
pub fn create_router(relay: Arc<Relay>, static_dir: Option<PathBuf>) -> Router {
    let state = AppState { relay };

    let mut router = Router::new()
        .merge(monitor::create_monitor_router())
        .merge(whip::create_whip_router())
        .merge(whep::create_whep_router());

    if let Some(dir) = static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    // Browsers need the Location header to address the session resource
    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers([LOCATION]),
        )
        .layer(TraceLayer::new_for_http());

    router.with_state(state)
}
