use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::{Activities, runner::StageJob};
use crate::{
    activity::{ActivityContext, ActivityError},
    clients::StageParams,
    store::models::{JobKind, NewJobRecord},
    util::idempotency::idempotency_key,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneInput {
    pub avatar_job_id: Uuid,
    pub owner_id: String,
    pub avatar_url: String,
    pub theme: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneOutput {
    pub result_url: String,
    pub scene_record_id: Uuid,
}

impl Activities {
    /// アバターを背景テーマに合成する。
    ///
    /// Scene の Job Record はワークフロー実行ごとに一度だけ作られ、再試行や再開では
    /// 同じレコードを使う。
    pub async fn generate_scene(
        &self,
        ctx: &ActivityContext,
        input: &SceneInput,
    ) -> Result<SceneOutput, ActivityError> {
        if input.owner_id.trim().is_empty() {
            return Err(ActivityError::Validation("ownerId is required".into()));
        }
        if input.avatar_url.trim().is_empty() {
            return Err(ActivityError::Validation("avatarUrl is required".into()));
        }
        if input.theme.trim().is_empty() {
            return Err(ActivityError::Validation("theme is required".into()));
        }

        let record = self
            .jobs
            .create_record(
                NewJobRecord::new(JobKind::Scene, input.owner_id.clone())
                    .with_input_url(input.avatar_url.clone())
                    .with_parent(input.avatar_job_id)
                    .with_params(json!({ "theme": input.theme }))
                    .with_idempotency_key(idempotency_key(ctx.workflow_id(), JobKind::Scene)),
            )
            .await
            .map_err(ActivityError::bookkeeping)?;

        let job = StageJob {
            kind: JobKind::Scene,
            id: record.id,
            owner_id: input.owner_id.clone(),
        };
        let params = StageParams::Scene {
            avatar_url: input.avatar_url.clone(),
            theme: input.theme.clone(),
        };
        let result_url = self.run_stage(ctx, &job, &params).await?;
        Ok(SceneOutput {
            result_url,
            scene_record_id: record.id,
        })
    }
}
