use axum::Router;

pub mod jobs;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new().nest("/v1/jobs", jobs::router())
}
