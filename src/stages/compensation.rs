use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::Activities;
use crate::{
    activity::ActivityError,
    store::models::{JobKind, JobRecord, JobStatus},
    util::text::truncate_error_message,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAssetInput {
    pub asset_key: String,
}

/// 補償対象のレコード。
///
/// ステージが途中で打ち切られた場合はレコードIDが手元に無いので、冪等キーで引く。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordRef {
    Id(Uuid),
    Key(String),
}

/// 完了しなかったステージがアップロードした可能性のあるアセット。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedAssetInput {
    pub kind: JobKind,
    pub target: RecordRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkFailedInput {
    pub kind: JobKind,
    pub target: RecordRef,
    pub error_text: String,
}

impl Activities {
    /// アセットを削除する。存在しないキーも成功扱い。
    pub async fn delete_asset(&self, input: &DeleteAssetInput) -> Result<(), ActivityError> {
        self.assets
            .delete(&input.asset_key)
            .await
            .map_err(ActivityError::Storage)?;
        info!(key = %input.asset_key, "compensation deleted asset");
        Ok(())
    }

    /// 完了しなかったステージのレコードに記録されたアップロード先を削除する。
    ///
    /// 試行が打ち切られてアセットだけが残った場合の後始末。完了済みのレコードは公開URL
    /// 側で扱うため対象外。削除したキーを返す。
    pub async fn delete_staged_asset(
        &self,
        input: &StagedAssetInput,
    ) -> Result<Option<String>, ActivityError> {
        let Some(record) = self.find_record(input.kind, &input.target).await? else {
            return Ok(None);
        };
        if record.status == JobStatus::Completed {
            return Ok(None);
        }
        let Some(key) = record.asset_key else {
            return Ok(None);
        };

        self.assets
            .delete(&key)
            .await
            .map_err(ActivityError::Storage)?;
        info!(kind = %input.kind, job_id = %record.id, key = %key, "compensation deleted staged asset");
        Ok(Some(key))
    }

    /// 非終端のレコードを failed にする。遷移した場合は true。
    ///
    /// 既に終端のレコードや、まだ作られていないレコードに対しては何もしない。
    pub async fn mark_record_failed(&self, input: &MarkFailedInput) -> Result<bool, ActivityError> {
        let found = self.find_record(input.kind, &input.target).await?;
        let Some(id) = found.map(|record| record.id) else {
            debug!(kind = %input.kind, target = ?input.target, "no record to mark failed");
            return Ok(false);
        };

        let error_text = truncate_error_message(&input.error_text);
        let changed = self
            .jobs
            .mark_failed(input.kind, id, &error_text)
            .await
            .map_err(ActivityError::bookkeeping)?;
        if changed {
            info!(kind = %input.kind, job_id = %id, "compensation marked record failed");
        }
        Ok(changed)
    }

    async fn find_record(
        &self,
        kind: JobKind,
        target: &RecordRef,
    ) -> Result<Option<JobRecord>, ActivityError> {
        match target {
            RecordRef::Id(id) => self.jobs.get_record(kind, *id).await,
            RecordRef::Key(key) => self.jobs.find_by_key(kind, key).await,
        }
        .map_err(ActivityError::bookkeeping)
    }
}
