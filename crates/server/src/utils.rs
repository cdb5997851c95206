use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::state::ErrorResponse;

pub fn json_error(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: None,
        }),
    )
}

pub fn json_error_response(status: StatusCode, message: impl Into<String>) -> Response {
    json_error(status, message).into_response()
}

/// Error body carrying a machine-readable category next to the message.
pub fn json_error_code(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: Some(code),
        }),
    )
        .into_response()
}

pub fn clamp_limit(limit: Option<usize>, default: usize, max: usize) -> usize {
    match limit {
        Some(0) | None => default,
        Some(value) => value.min(max),
    }
}
