//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::DaqError;

/// Error returned by every handler
#[derive(Debug)]
pub struct ApiError(pub DaqError);

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable message
    pub error: String,
    /// Stable machine-readable code
    pub code: &'static str,
}

impl ApiError {
    /// Status and code for the wrapped error.
    pub fn status(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            DaqError::ConfigInvalid(_) => (StatusCode::BAD_REQUEST, "CONFIG_INVALID"),
            DaqError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            DaqError::Device(_) => (StatusCode::BAD_GATEWAY, "DEVICE_ERROR"),
            DaqError::HardwareBusy(_) => (StatusCode::SERVICE_UNAVAILABLE, "HARDWARE_BUSY"),
            DaqError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            DaqError::Config(_) | DaqError::Io(_) | DaqError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        }
    }
}

impl From<DaqError> for ApiError {
    fn from(err: DaqError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        let body = ErrorResponse {
            error: self.0.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn errors_map_to_documented_status_codes() {
        let cases = [
            (DaqError::ConfigInvalid("x".into()), StatusCode::BAD_REQUEST),
            (DaqError::Conflict("x".into()), StatusCode::CONFLICT),
            (DaqError::Device("x".into()), StatusCode::BAD_GATEWAY),
            (DaqError::HardwareBusy("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (DaqError::Timeout(Duration::from_secs(1)), StatusCode::GATEWAY_TIMEOUT),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }
}
