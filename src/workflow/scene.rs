use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use super::{WorkflowContext, WorkflowError};
use crate::{
    stages::{
        AnimationInput, DeleteAssetInput, MarkFailedInput, NarrativeParameters, RecordRef,
        SceneInput, StagedAssetInput,
    },
    store::models::{JobKind, WorkflowStage},
    util::idempotency::idempotency_key,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneWorkflowInput {
    pub avatar_id: Uuid,
    pub owner_id: String,
    pub avatar_url: String,
    pub theme: String,
    pub narrative: NarrativeParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneWorkflowResult {
    pub scene_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_video_url: Option<String>,
}

/// Scene 完了後に記録する再開ポイント。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SceneCheckpoint {
    #[serde(default)]
    pub(crate) scene_record_id: Option<Uuid>,
    #[serde(default)]
    pub(crate) scene_url: Option<String>,
}

impl SceneCheckpoint {
    pub(crate) fn from_value(raw: &Value) -> Self {
        if raw.is_null() {
            return Self::default();
        }
        serde_json::from_value(raw.clone()).unwrap_or_else(|err| {
            warn!(error = %err, "ignoring unreadable scene checkpoint");
            Self::default()
        })
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// `scene-<avatar>-<theme>-<millis>` の形式のワークフローID。
#[must_use]
pub fn workflow_id(avatar_id: Uuid, theme: &str, started_at_millis: i64) -> String {
    format!("scene-{avatar_id}-{theme}-{started_at_millis}")
}

/// Scene+Animation ワークフロー。
///
/// チェックポイントに Scene の結果があれば Scene を飛ばして Animation から再開する。
pub(crate) async fn run(
    ctx: &WorkflowContext,
    input: &SceneWorkflowInput,
    checkpoint: SceneCheckpoint,
) -> Result<Value, WorkflowError> {
    let activities = &ctx.activities;

    let scene = match (checkpoint.scene_record_id, checkpoint.scene_url) {
        (Some(id), Some(url)) => {
            info!(workflow_id = %ctx.id, scene_record_id = %id, "resuming after completed scene");
            (id, url)
        }
        _ => {
            ctx.advance(WorkflowStage::GeneratingScene, &json!({})).await;
            let scene_input = SceneInput {
                avatar_job_id: input.avatar_id,
                owner_id: input.owner_id.clone(),
                avatar_url: input.avatar_url.clone(),
                theme: input.theme.clone(),
            };
            let scene_input = &scene_input;
            match ctx
                .call("generate_scene", move |actx| async move {
                    activities.generate_scene(&actx, scene_input).await
                })
                .await
            {
                Ok(output) => (output.scene_record_id, output.result_url),
                Err(err) => return Err(compensate(ctx, input, &[], JobKind::Scene, err).await),
            }
        }
    };
    let (scene_record_id, scene_url) = scene;

    let checkpoint = SceneCheckpoint {
        scene_record_id: Some(scene_record_id),
        scene_url: Some(scene_url.clone()),
    };
    ctx.advance(WorkflowStage::GeneratingAnimation, &checkpoint.to_value())
        .await;

    let animation_input = AnimationInput {
        scene_record_id,
        scene_url: scene_url.clone(),
        owner_id: input.owner_id.clone(),
        narrative: input.narrative.clone(),
    };
    let animation_input = &animation_input;
    let animation = ctx
        .call("generate_animation", move |actx| async move {
            activities.generate_animation(&actx, animation_input).await
        })
        .await;

    match animation {
        Ok(output) => {
            let result = SceneWorkflowResult {
                scene_url: scene_url.clone(),
                final_video_url: Some(output.result_url.clone()),
            };
            match serde_json::to_value(&result) {
                Ok(value) => {
                    ctx.advance(WorkflowStage::Completed, &checkpoint.to_value())
                        .await;
                    info!(workflow_id = %ctx.id, "scene workflow completed");
                    Ok(value)
                }
                Err(err) => {
                    let err = WorkflowError::Internal(format!("unserializable result: {err}"));
                    let produced = [output.result_url.as_str(), scene_url.as_str()];
                    Err(compensate(ctx, input, &produced, JobKind::Animation, err).await)
                }
            }
        }
        Err(err) => {
            let produced = [scene_url.as_str()];
            Err(compensate(ctx, input, &produced, JobKind::Animation, err).await)
        }
    }
}

/// 決まった順に補償を実行する。各手順は独立しており、失敗しても次へ進む。
///
/// `produced` は公開済みの成果物URLを下流から順に並べたもの。
async fn compensate(
    ctx: &WorkflowContext,
    input: &SceneWorkflowInput,
    produced: &[&str],
    failed_stage: JobKind,
    err: WorkflowError,
) -> WorkflowError {
    warn!(
        workflow_id = %ctx.id,
        failed_stage = %failed_stage,
        error = %err,
        "scene workflow failed, compensating"
    );
    let activities = &ctx.activities;
    let stage_record = RecordRef::Key(idempotency_key(&ctx.id, failed_stage));

    let staged = StagedAssetInput {
        kind: failed_stage,
        target: stage_record.clone(),
    };
    let staged = &staged;
    ctx.compensate("delete_staged_asset", move |_actx| async move {
        activities.delete_staged_asset(staged).await
    })
    .await;

    let avatar = ctx
        .settings
        .delete_avatar_on_failure
        .then_some(input.avatar_url.as_str());
    let urls = produced.iter().copied().chain(avatar);
    for url in urls {
        let Some(asset_key) = activities.asset_key_for(url) else {
            warn!(workflow_id = %ctx.id, url, "skipping deletion of unrecognized asset URL");
            continue;
        };
        let delete = DeleteAssetInput { asset_key };
        let delete = &delete;
        ctx.compensate("delete_asset", move |_actx| async move {
            activities.delete_asset(delete).await
        })
        .await;
    }

    let mark = MarkFailedInput {
        kind: failed_stage,
        target: stage_record,
        error_text: err.to_string(),
    };
    let mark = &mark;
    ctx.compensate("mark_record_failed", move |_actx| async move {
        activities.mark_record_failed(mark).await
    })
    .await;

    ctx.fail();
    err
}
