use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use super::{WorkflowContext, WorkflowError};
use crate::{
    stages::{AvatarInput, MarkFailedInput, RecordRef, StagedAssetInput},
    store::models::{JobKind, WorkflowStage},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarWorkflowInput {
    pub avatar_id: Uuid,
    pub owner_id: String,
    pub original_url: String,
}

/// `avatar-<id>` の形式のワークフローID。
#[must_use]
pub fn workflow_id(avatar_id: Uuid) -> String {
    format!("avatar-{avatar_id}")
}

/// Avatar ワークフロー。成功時は `{avatarUrl}` を返す。
pub(crate) async fn run(
    ctx: &WorkflowContext,
    input: &AvatarWorkflowInput,
) -> Result<Value, WorkflowError> {
    ctx.advance(WorkflowStage::GeneratingAvatar, &json!({})).await;

    let activities = &ctx.activities;
    let stage_input = AvatarInput {
        job_id: input.avatar_id,
        owner_id: input.owner_id.clone(),
        input_image_url: input.original_url.clone(),
    };
    let stage_input = &stage_input;

    let outcome = ctx
        .call("generate_avatar", move |actx| async move {
            activities.generate_avatar(&actx, stage_input).await
        })
        .await;

    match outcome {
        Ok(output) => {
            ctx.advance(WorkflowStage::Completed, &json!({})).await;
            info!(workflow_id = %ctx.id, avatar_id = %input.avatar_id, "avatar workflow completed");
            Ok(json!({ "avatarUrl": output.result_url }))
        }
        Err(err) => {
            let staged = StagedAssetInput {
                kind: JobKind::Avatar,
                target: RecordRef::Id(input.avatar_id),
            };
            let staged = &staged;
            ctx.compensate("delete_staged_asset", move |_actx| async move {
                activities.delete_staged_asset(staged).await
            })
            .await;

            let mark = MarkFailedInput {
                kind: JobKind::Avatar,
                target: RecordRef::Id(input.avatar_id),
                error_text: err.to_string(),
            };
            let mark = &mark;
            ctx.compensate("mark_record_failed", move |_actx| async move {
                activities.mark_record_failed(mark).await
            })
            .await;
            ctx.fail();
            Err(err)
        }
    }
}
