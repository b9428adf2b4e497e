use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Activities, runner::StageJob};
use crate::{
    activity::{ActivityContext, ActivityError},
    clients::StageParams,
    store::models::{JobKind, NewJobRecord},
    util::idempotency::idempotency_key,
};

/// アニメーションの長さと演出。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrativeParameters {
    pub duration_seconds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimationInput {
    pub scene_record_id: Uuid,
    pub scene_url: String,
    pub owner_id: String,
    pub narrative: NarrativeParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimationOutput {
    pub result_url: String,
}

impl Activities {
    /// シーン画像を短い動画にする。
    pub async fn generate_animation(
        &self,
        ctx: &ActivityContext,
        input: &AnimationInput,
    ) -> Result<AnimationOutput, ActivityError> {
        if input.owner_id.trim().is_empty() {
            return Err(ActivityError::Validation("ownerId is required".into()));
        }
        if input.scene_url.trim().is_empty() {
            return Err(ActivityError::Validation("sceneUrl is required".into()));
        }
        if input.narrative.duration_seconds == 0 {
            return Err(ActivityError::Validation(
                "durationSeconds must be positive".into(),
            ));
        }

        let params_json = serde_json::to_value(&input.narrative)
            .map_err(|err| ActivityError::Validation(format!("invalid narrative: {err}")))?;
        let record = self
            .jobs
            .create_record(
                NewJobRecord::new(JobKind::Animation, input.owner_id.clone())
                    .with_input_url(input.scene_url.clone())
                    .with_parent(input.scene_record_id)
                    .with_params(params_json)
                    .with_idempotency_key(idempotency_key(ctx.workflow_id(), JobKind::Animation)),
            )
            .await
            .map_err(ActivityError::bookkeeping)?;

        let job = StageJob {
            kind: JobKind::Animation,
            id: record.id,
            owner_id: input.owner_id.clone(),
        };
        let params = StageParams::Animation {
            scene_url: input.scene_url.clone(),
            duration_seconds: input.narrative.duration_seconds,
            prompt: input.narrative.prompt.clone(),
        };
        let result_url = self.run_stage(ctx, &job, &params).await?;
        Ok(AnimationOutput { result_url })
    }
}
