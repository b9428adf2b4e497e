use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use super::engine_error_response;
use crate::app::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlResponse {
    workflow_id: String,
    status: &'static str,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TerminateParams {
    #[serde(default)]
    reason: Option<String>,
}

pub(crate) async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine().describe(&id).await {
        Ok(description) => (StatusCode::OK, Json(description)).into_response(),
        Err(err) => engine_error_response(&err),
    }
}

pub(crate) async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine().cancel(&id).await {
        Ok(()) => {
            let body = Json(ControlResponse {
                workflow_id: id,
                status: "cancel_requested",
            });
            (StatusCode::ACCEPTED, body).into_response()
        }
        Err(err) => engine_error_response(&err),
    }
}

pub(crate) async fn terminate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TerminateParams>,
) -> impl IntoResponse {
    match state.engine().terminate(&id, params.reason).await {
        Ok(()) => {
            let body = Json(ControlResponse {
                workflow_id: id,
                status: "terminated",
            });
            (StatusCode::OK, body).into_response()
        }
        Err(err) => engine_error_response(&err),
    }
}
