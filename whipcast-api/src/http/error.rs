// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Convert relay errors to HTTP errors
impl From<whipcast_sfu::Error> for AppError {
    fn from(err: whipcast_sfu::Error) -> Self {
        use whipcast_sfu::Error;

        match err {
            Error::Conflict(_) => AppError::conflict(err.to_string()),
            Error::NotFound(_) => AppError::not_found(err.to_string()),
            Error::InvalidStreamId(_) | Error::InvalidDescription(_) => {
                AppError::bad_request(err.to_string())
            }
            Error::Setup(e) => {
                tracing::error!("Session setup error: {}", e);
                AppError::internal_server_error("Failed to set up media session")
            }
            Error::Handshake(e) => {
                tracing::error!("Signaling error: {}", e);
                AppError::internal_server_error("Failed to negotiate session")
            }
            Error::GatherTimeout(timeout) => {
                tracing::error!("Candidate gathering timed out after {:?}", timeout);
                AppError::internal_server_error("Candidate gathering timed out")
            }
            Error::Transport(e) => {
                tracing::error!("Transport error: {}", e);
                AppError::internal_server_error("Internal server error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use whipcast_sfu::{Error, StreamId};

    #[test]
    fn test_relay_error_status() {
        let id = StreamId::parse("cam1").unwrap();
        let cases = [
            (Error::Conflict(id.clone()), StatusCode::CONFLICT),
            (Error::NotFound(id), StatusCode::NOT_FOUND),
            (Error::InvalidStreamId("".to_string()), StatusCode::BAD_REQUEST),
            (Error::InvalidDescription("empty offer".to_string()), StatusCode::BAD_REQUEST),
            (Error::Setup("codec".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
            (Error::Handshake("sdp".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                Error::GatherTimeout(Duration::from_secs(10)),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn test_internal_details_hidden() {
        let err = AppError::from(Error::Setup("failed to register codec: boom".to_string()));
        assert!(!err.message.contains("boom"));
    }
}
