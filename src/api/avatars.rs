use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use url::Url;
use uuid::Uuid;

use super::{engine_error_response, error_response};
use crate::{
    app::AppState,
    store::{
        dao::JobDao,
        models::{JobKind, NewJobRecord},
    },
    util::text::truncate_error_message,
    workflow::AvatarWorkflowInput,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateAvatarRequest {
    owner_id: String,
    original_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateAvatarResponse {
    avatar_id: Uuid,
    workflow_id: String,
}

fn validate(request: &CreateAvatarRequest) -> Result<(), String> {
    if request.owner_id.trim().is_empty() {
        return Err("ownerId is required".into());
    }
    match Url::parse(request.original_url.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        Ok(_) => Err("originalUrl must be an http(s) URL".into()),
        Err(_) => Err("originalUrl is not a valid URL".into()),
    }
}

/// Avatar レコードを作成し、生成ワークフローを起動する。
pub(crate) async fn create_avatar(
    State(state): State<AppState>,
    Json(payload): Json<CreateAvatarRequest>,
) -> impl IntoResponse {
    if let Err(message) = validate(&payload) {
        return error_response(StatusCode::BAD_REQUEST, message);
    }

    let jobs = state.jobs();
    let owner_id = payload.owner_id.trim().to_string();
    let original_url = payload.original_url.trim().to_string();
    let record = match jobs
        .create_record(
            NewJobRecord::new(JobKind::Avatar, owner_id.clone()).with_input_url(original_url.clone()),
        )
        .await
    {
        Ok(record) => record,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to create avatar record");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to create avatar");
        }
    };

    let input = AvatarWorkflowInput {
        avatar_id: record.id,
        owner_id,
        original_url,
    };
    match state.engine().start_avatar(input).await {
        Ok(workflow_id) => {
            info!(avatar_id = %record.id, %workflow_id, "avatar generation accepted");
            let body = Json(CreateAvatarResponse {
                avatar_id: record.id,
                workflow_id,
            });
            (StatusCode::ACCEPTED, body).into_response()
        }
        Err(err) => {
            let text = truncate_error_message(&format!("failed to start workflow: {err}"));
            if let Err(mark_err) = jobs.mark_failed(JobKind::Avatar, record.id, &text).await {
                error!(
                    critical = true,
                    avatar_id = %record.id,
                    error = %format!("{mark_err:#}"),
                    "failed to mark avatar failed after start failure"
                );
            }
            engine_error_response(&err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(owner: &str, url: &str) -> CreateAvatarRequest {
        CreateAvatarRequest {
            owner_id: owner.into(),
            original_url: url.into(),
        }
    }

    #[test]
    fn rejects_missing_owner_and_bad_urls() {
        assert!(validate(&request("", "https://uploads.example.com/a.jpg")).is_err());
        assert!(validate(&request("u1", "not a url")).is_err());
        assert!(validate(&request("u1", "ftp://uploads.example.com/a.jpg")).is_err());
        assert!(validate(&request("u1", "https://uploads.example.com/a.jpg")).is_ok());
    }
}
