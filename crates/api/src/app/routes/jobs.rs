use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::{info_span, Instrument};

use relayq_core::{JobId, RestError};
use relayq_infra::WorkContext;
use relayq_infra::store::StoreError;

use crate::app::dto::{JobStatusRequest, JobView};
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/:name/:id", get(get_job).post(status_callback))
}

/// Worker status callback for one job.
pub async fn status_callback(
    Extension(services): Extension<Arc<AppServices>>,
    Path((name, id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let instance = format!("/v1/jobs/{name}/{id}");

    let request: JobStatusRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return errors::rest_error(
                StatusCode::BAD_REQUEST,
                RestError::new("invalid_request", "Invalid request body")
                    .with_detail(e.to_string())
                    .with_instance(instance),
            );
        }
    };
    let update = match request.resolve() {
        Ok(update) => update,
        Err(err) => return errors::rest_error(StatusCode::BAD_REQUEST, err.with_instance(instance)),
    };
    let id: JobId = match id.parse() {
        Ok(id) => id,
        Err(_) => return errors::bad_request("invalid_id", "Invalid job id", &instance),
    };

    let ctx = WorkContext::with_timeout(services.callback_timeout);
    let span = info_span!("status_callback_request", %instance);
    let result = services
        .reconciler
        .handle_status_callback(
            &ctx,
            &id,
            &name,
            update.status,
            update.attempt,
            update.retryable,
        )
        .instrument(span)
        .await;

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => errors::status_callback_error_to_response(err, &instance),
    }
}

/// Current record for a job: queued if still pending, otherwise archived.
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path((name, id)): Path<(String, String)>,
) -> Response {
    let instance = format!("/v1/jobs/{name}/{id}");
    let not_found = || {
        errors::rest_error(
            StatusCode::NOT_FOUND,
            RestError::new("not_found", "Resource not found").with_instance(instance.clone()),
        )
    };

    let id: JobId = match id.parse() {
        Ok(id) => id,
        Err(_) => return errors::bad_request("invalid_id", "Invalid job id", &instance),
    };

    let view = match services.store.get_queued_job(&id).await {
        Ok(job) if job.name == name => JobView::from(job),
        Ok(_) => return not_found(),
        Err(StoreError::NotFound(_)) => match services.store.get_archived_job(&id).await {
            Ok(job) if job.name == name => JobView::from(job),
            Ok(_) | Err(StoreError::NotFound(_)) => return not_found(),
            Err(e) => {
                tracing::error!(error = %e, "failed to load archived job");
                return errors::server_error(&instance);
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "failed to load queued job");
            return errors::server_error(&instance);
        }
    };

    Json(view).into_response()
}
