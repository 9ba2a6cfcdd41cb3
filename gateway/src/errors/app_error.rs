//! HTTP-facing error type for the submission surface.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use super::call_error::CallError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Call(#[from] CallError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Call(err) => match err {
                CallError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
                CallError::NotConnected | CallError::EngineStopped => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                CallError::InvalidRequest(_) | CallError::UnknownExtension(_) => {
                    StatusCode::BAD_REQUEST
                }
                CallError::UnknownTicket(_) | CallError::UnknownGroup(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::Call(err) => err.code(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "Request failed: {}", self);
        } else {
            tracing::debug!(code = self.code(), "Request rejected: {}", self);
        }
        (
            status,
            Json(json!({ "error": self.to_string(), "code": self.code() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let capacity = AppError::from(CallError::CapacityExceeded { queued: 1, bound: 1 });
        assert_eq!(capacity.status(), StatusCode::SERVICE_UNAVAILABLE);

        let group = AppError::from(CallError::UnknownGroup("family".into()));
        assert_eq!(group.status(), StatusCode::NOT_FOUND);

        let bad = AppError::BadRequest("no audio source".into());
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let io = AppError::from(CallError::Io(std::io::Error::other("disk")));
        assert_eq!(io.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
