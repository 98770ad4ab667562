use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use relayq_core::RestError;
use relayq_infra::jobs::StatusCallbackError;

/// Render a structured error body with its HTTP status.
pub fn rest_error(status: StatusCode, err: RestError) -> Response {
    (status, Json(err.with_status(status.as_u16()))).into_response()
}

pub fn bad_request(id: &str, title: &str, instance: &str) -> Response {
    rest_error(
        StatusCode::BAD_REQUEST,
        RestError::new(id, title).with_instance(instance),
    )
}

pub fn status_callback_error_to_response(err: StatusCallbackError, instance: &str) -> Response {
    match err {
        StatusCallbackError::NotFound { .. } => rest_error(
            StatusCode::BAD_REQUEST,
            RestError::new(
                "duplicate_status_request",
                "This job has already been archived, or was never queued",
            )
            .with_detail(err.to_string())
            .with_instance(instance),
        ),
        StatusCallbackError::FailedDecrement { .. } => rest_error(
            StatusCode::BAD_REQUEST,
            RestError::new(
                "decrement_failed",
                "Could not decrement the attempts remaining for this job",
            )
            .with_detail(err.to_string())
            .with_instance(instance),
        ),
        StatusCallbackError::Interrupted(_) | StatusCallbackError::Store(_) => {
            error!(error = %err, %instance, "status callback failed");
            server_error(instance)
        }
    }
}

pub fn server_error(instance: &str) -> Response {
    rest_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        RestError::new("server_error", "Unexpected server error").with_instance(instance),
    )
}
