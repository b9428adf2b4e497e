pub(crate) mod avatars;
pub(crate) mod health;
pub(crate) mod jobs;
pub(crate) mod metrics;
pub(crate) mod scenes;
pub(crate) mod workflows;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tracing::error;

use crate::{app::AppState, workflow::EngineError};

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/ready", get(health::ready))
        .route("/health/live", get(health::live))
        .route("/metrics", get(metrics::exporter))
        .route("/v1/avatars", post(avatars::create_avatar))
        .route("/v1/scenes", post(scenes::create_scene))
        .route("/v1/workflows/{id}/status", get(workflows::status))
        .route("/v1/workflows/{id}/cancel", post(workflows::cancel))
        .route("/v1/workflows/{id}/terminate", post(workflows::terminate))
        .route("/v1/jobs/{kind}/{id}", get(jobs::get_job))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = Json(ErrorResponse {
        error: message.into(),
    });
    (status, body).into_response()
}

pub(crate) fn engine_error_response(err: &EngineError) -> Response {
    match err {
        EngineError::NotFound(_) => error_response(StatusCode::NOT_FOUND, err.to_string()),
        EngineError::AlreadyExists(_) | EngineError::Closed(_) | EngineError::NotLive(_) => {
            error_response(StatusCode::CONFLICT, err.to_string())
        }
        EngineError::Store(source) => {
            error!(error = %format!("{source:#}"), "workflow store failure");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}
