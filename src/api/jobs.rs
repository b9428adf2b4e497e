use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use super::error_response;
use crate::{
    app::AppState,
    store::{
        dao::JobDao,
        models::{JobKind, JobRecord, JobStatus},
    },
};

#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusResponse {
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<JobRecord> for JobStatusResponse {
    fn from(record: JobRecord) -> Self {
        Self {
            status: record.status,
            result_url: record
                .result_url
                .filter(|_| record.status == JobStatus::Completed),
            error: record
                .error_text
                .filter(|_| record.status == JobStatus::Failed),
        }
    }
}

pub(crate) async fn get_job(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, Uuid)>,
) -> impl IntoResponse {
    let Ok(kind) = kind.parse::<JobKind>() else {
        return error_response(StatusCode::BAD_REQUEST, format!("unknown job kind: {kind}"));
    };

    match state.jobs().get_record(kind, id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(JobStatusResponse::from(record))).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("{kind} job {id} not found")),
        Err(err) => {
            error!(error = %format!("{err:#}"), %kind, %id, "failed to load job record");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load job")
        }
    }
}
