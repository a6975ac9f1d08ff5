// Whipcast API Library
//
// HTTP signaling endpoints (WHIP ingest, WHEP egress) and monitoring routes

pub mod http;

// Re-export commonly used types
pub use http::{create_router, AppState};
