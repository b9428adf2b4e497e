use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Activities, runner::StageJob};
use crate::{
    activity::{ActivityContext, ActivityError},
    clients::StageParams,
    store::models::JobKind,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarInput {
    pub job_id: Uuid,
    pub owner_id: String,
    pub input_image_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarOutput {
    pub result_url: String,
}

impl Activities {
    /// 自撮り画像からアバターを生成する。
    pub async fn generate_avatar(
        &self,
        ctx: &ActivityContext,
        input: &AvatarInput,
    ) -> Result<AvatarOutput, ActivityError> {
        if input.owner_id.trim().is_empty() {
            return Err(ActivityError::Validation("ownerId is required".into()));
        }
        if input.input_image_url.trim().is_empty() {
            return Err(ActivityError::Validation("inputImageUrl is required".into()));
        }

        let job = StageJob {
            kind: JobKind::Avatar,
            id: input.job_id,
            owner_id: input.owner_id.clone(),
        };
        let params = StageParams::Avatar {
            image_url: input.input_image_url.clone(),
        };
        let result_url = self.run_stage(ctx, &job, &params).await?;
        Ok(AvatarOutput { result_url })
    }
}
