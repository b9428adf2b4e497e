use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use super::{engine_error_response, error_response};
use crate::{
    app::AppState,
    config::Config,
    stages::NarrativeParameters,
    store::{
        dao::JobDao,
        models::{JobKind, JobStatus},
    },
    workflow::SceneWorkflowInput,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSceneRequest {
    avatar_id: Uuid,
    owner_id: String,
    theme: String,
    #[serde(default)]
    duration_seconds: Option<u32>,
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSceneResponse {
    workflow_id: String,
}

fn normalize_theme(config: &Config, raw: &str) -> Result<String, String> {
    let theme = raw.trim().to_lowercase();
    if theme.is_empty() {
        return Err("theme is required".into());
    }
    if !config.scene_themes().iter().any(|t| *t == theme) {
        return Err(format!(
            "unknown theme {theme}; expected one of {}",
            config.scene_themes().join(", ")
        ));
    }
    Ok(theme)
}

fn resolve_duration(config: &Config, requested: Option<u32>) -> Result<u32, String> {
    let duration = requested.unwrap_or(config.animation_default_duration_secs());
    let max = config.animation_max_duration_secs();
    if duration == 0 || duration > max {
        return Err(format!("durationSeconds must be between 1 and {max}"));
    }
    Ok(duration)
}

/// 完了済みのアバターから Scene+Animation ワークフローを起動する。
pub(crate) async fn create_scene(
    State(state): State<AppState>,
    Json(payload): Json<CreateSceneRequest>,
) -> impl IntoResponse {
    let owner_id = payload.owner_id.trim().to_string();
    if owner_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "ownerId is required");
    }
    let theme = match normalize_theme(state.config(), &payload.theme) {
        Ok(theme) => theme,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    let duration_seconds = match resolve_duration(state.config(), payload.duration_seconds) {
        Ok(duration) => duration,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };

    let avatar = match state.jobs().get_record(JobKind::Avatar, payload.avatar_id).await {
        Ok(Some(record)) if record.owner_id == owner_id => record,
        Ok(_) => return error_response(StatusCode::NOT_FOUND, "avatar not found"),
        Err(err) => {
            error!(error = %format!("{err:#}"), avatar_id = %payload.avatar_id, "failed to load avatar");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load avatar");
        }
    };
    let avatar_url = match (avatar.status, avatar.result_url) {
        (JobStatus::Completed, Some(url)) => url,
        _ => return error_response(StatusCode::BAD_REQUEST, "avatar is not ready"),
    };

    let input = SceneWorkflowInput {
        avatar_id: avatar.id,
        owner_id,
        avatar_url,
        theme,
        narrative: NarrativeParameters {
            duration_seconds,
            prompt: payload
                .prompt
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
        },
    };
    match state.engine().start_scene(input).await {
        Ok(workflow_id) => {
            info!(avatar_id = %avatar.id, %workflow_id, "scene generation accepted");
            (StatusCode::ACCEPTED, Json(CreateSceneResponse { workflow_id })).into_response()
        }
        Err(err) => engine_error_response(&err),
    }
}
