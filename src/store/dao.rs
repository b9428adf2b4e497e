pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    JobKind, JobRecord, NewJobRecord, NewWorkflowRun, RunClosure, WorkflowRun, WorkflowStage,
};

pub use self::postgres::PgComicDao;

/// Job Record への読み書き。
///
/// 状態遷移は単調で、終端状態（completed / failed）からは動かない。
/// 遷移が拒否された場合は [`super::RecordStateError`] を含むエラーを返す。
#[async_trait]
pub trait JobDao: Send + Sync {
    /// レコードを queued で作成する。冪等キーが一致するレコードが既にあればそれを返す。
    async fn create_record(&self, new: NewJobRecord) -> Result<JobRecord>;

    async fn get_record(&self, kind: JobKind, id: Uuid) -> Result<Option<JobRecord>>;

    async fn find_by_key(&self, kind: JobKind, key: &str) -> Result<Option<JobRecord>>;

    /// queued / processing → processing。終端状態なら拒否する。
    async fn mark_processing(&self, kind: JobKind, id: Uuid) -> Result<()>;

    /// プロバイダのジョブIDと依頼時刻を一度だけ記録する。同じIDの再記録は成功扱いで、
    /// 最初に記録した時刻を保つ。
    async fn set_provider_job_id(
        &self,
        kind: JobKind,
        id: Uuid,
        handle: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<()>;

    /// アップロード先のキーを記録する。非終端のレコードに限る。
    async fn set_asset_key(&self, kind: JobKind, id: Uuid, key: &str) -> Result<()>;

    /// processing → completed。同じURLで既に completed なら成功扱い。
    async fn mark_completed(&self, kind: JobKind, id: Uuid, result_url: &str) -> Result<()>;

    /// 非終端 → failed。遷移した場合は true、既に終端なら何もせず false。
    async fn mark_failed(&self, kind: JobKind, id: Uuid, error_text: &str) -> Result<bool>;

    async fn ping(&self) -> Result<()>;
}

/// ワークフロー実行ログへの読み書き。
#[async_trait]
pub trait WorkflowRunDao: Send + Sync {
    /// RUNNING で登録する。同じIDが既に存在する場合は false。
    async fn insert_run(&self, run: NewWorkflowRun) -> Result<bool>;

    async fn get_run(&self, id: &str) -> Result<Option<WorkflowRun>>;

    /// ステージ遷移とチェックポイントを記録する。
    async fn record_stage(
        &self,
        id: &str,
        stage: WorkflowStage,
        checkpoint: &serde_json::Value,
    ) -> Result<()>;

    /// 実行を終了状態にする。既に終了済みなら false。
    async fn close_run(&self, id: &str, closure: RunClosure) -> Result<bool>;

    async fn list_running(&self) -> Result<Vec<WorkflowRun>>;

    /// `cutoff` より前に終了した実行を削除し、削除件数を返す。
    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
