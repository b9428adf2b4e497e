use std::{fmt, str::FromStr};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// パイプラインのステージ種別。Job Record のテーブルとアセット名を決める。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Avatar,
    Scene,
    Animation,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Avatar, JobKind::Scene, JobKind::Animation];

    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            JobKind::Avatar => "avatar_jobs",
            JobKind::Scene => "scene_jobs",
            JobKind::Animation => "animation_jobs",
        }
    }

    /// プロバイダが Content-Type を返さなかった場合の既定値。
    #[must_use]
    pub fn default_content_type(self) -> &'static str {
        match self {
            JobKind::Avatar | JobKind::Scene => "image/png",
            JobKind::Animation => "video/mp4",
        }
    }
}

impl AsRef<str> for JobKind {
    fn as_ref(&self) -> &str {
        match self {
            JobKind::Avatar => "avatar",
            JobKind::Scene => "scene",
            JobKind::Animation => "animation",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avatar" | "avatars" => Ok(JobKind::Avatar),
            "scene" | "scenes" => Ok(JobKind::Scene),
            "animation" | "animations" => Ok(JobKind::Animation),
            other => Err(anyhow!("unknown job kind: {other}")),
        }
    }
}

/// JobStatus - Job Record の状態を表す列挙型。
///
/// queued → processing → completed | failed の順にのみ進み、終端状態からは戻らない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// `next` への遷移が許可されるかどうか。
    ///
    /// processing → processing はリトライ時の再マークとして許可する。
    #[must_use]
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Processing | JobStatus::Failed) => true,
            (
                JobStatus::Processing,
                JobStatus::Processing | JobStatus::Completed | JobStatus::Failed,
            ) => true,
            _ => false,
        }
    }
}

impl AsRef<str> for JobStatus {
    fn as_ref(&self) -> &str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(anyhow!("unknown job status: {other}")),
        }
    }
}

/// Job Record - ステージ1回分の永続化された進捗。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: JobKind,
    pub owner_id: String,
    pub status: JobStatus,
    /// プロバイダ側のジョブID。再開時のアンカーとして使う。
    pub provider_job_id: Option<String>,
    /// 生成依頼を送った時刻。ポーリング上限はここから数える。
    pub provider_submitted_at: Option<DateTime<Utc>>,
    /// アップロード先のキー。アップロードの前に記録する。
    pub asset_key: Option<String>,
    pub result_url: Option<String>,
    pub error_text: Option<String>,
    /// 前段ステージの成果物URL（値としてコピーされる）。
    pub input_url: Option<String>,
    pub parent_id: Option<Uuid>,
    pub params: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// completed ⇒ resultUrl のみ、failed ⇒ errorText のみ、それ以外は両方空。
    #[must_use]
    pub fn satisfies_outcome_invariant(&self) -> bool {
        let has_result = self.result_url.as_deref().is_some_and(|u| !u.is_empty());
        let has_error = self.error_text.as_deref().is_some_and(|e| !e.is_empty());
        match self.status {
            JobStatus::Completed => has_result && !has_error,
            JobStatus::Failed => has_error && !has_result,
            JobStatus::Queued | JobStatus::Processing => !has_result && !has_error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJobRecord {
    pub kind: JobKind,
    pub owner_id: String,
    pub input_url: Option<String>,
    pub parent_id: Option<Uuid>,
    pub params: serde_json::Value,
    pub idempotency_key: Option<String>,
}

impl NewJobRecord {
    #[must_use]
    pub fn new(kind: JobKind, owner_id: impl Into<String>) -> Self {
        Self {
            kind,
            owner_id: owner_id.into(),
            input_url: None,
            parent_id: None,
            params: serde_json::Value::Object(serde_json::Map::new()),
            idempotency_key: None,
        }
    }

    #[must_use]
    pub fn with_input_url(mut self, url: impl Into<String>) -> Self {
        self.input_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// ワークフロー定義の種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Avatar,
    SceneAnimation,
}

impl AsRef<str> for WorkflowKind {
    fn as_ref(&self) -> &str {
        match self {
            WorkflowKind::Avatar => "avatar",
            WorkflowKind::SceneAnimation => "scene_animation",
        }
    }
}

impl FromStr for WorkflowKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avatar" => Ok(WorkflowKind::Avatar),
            "scene_animation" => Ok(WorkflowKind::SceneAnimation),
            other => Err(anyhow!("unknown workflow kind: {other}")),
        }
    }
}

/// 外部に公開されるワークフロー実行の状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    Terminated,
    Canceled,
}

impl ExecutionStatus {
    #[must_use]
    pub fn is_closed(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl AsRef<str> for ExecutionStatus {
    fn as_ref(&self) -> &str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::TimedOut => "TIMED_OUT",
            ExecutionStatus::Terminated => "TERMINATED",
            ExecutionStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(ExecutionStatus::Running),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "TIMED_OUT" => Ok(ExecutionStatus::TimedOut),
            "TERMINATED" => Ok(ExecutionStatus::Terminated),
            "CANCELED" => Ok(ExecutionStatus::Canceled),
            other => Err(anyhow!("unknown execution status: {other}")),
        }
    }
}

/// ワークフローの現在ステージ。クエリで同期的に参照される。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStage {
    Queued,
    GeneratingAvatar,
    GeneratingScene,
    GeneratingAnimation,
    Completed,
    Failed,
}

impl WorkflowStage {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStage::Completed | WorkflowStage::Failed)
    }

    /// 単調増加の判定に使う順位。
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            WorkflowStage::Queued => 0,
            WorkflowStage::GeneratingAvatar => 1,
            WorkflowStage::GeneratingScene => 2,
            WorkflowStage::GeneratingAnimation => 3,
            WorkflowStage::Completed | WorkflowStage::Failed => 4,
        }
    }
}

impl AsRef<str> for WorkflowStage {
    fn as_ref(&self) -> &str {
        match self {
            WorkflowStage::Queued => "QUEUED",
            WorkflowStage::GeneratingAvatar => "GENERATING_AVATAR",
            WorkflowStage::GeneratingScene => "GENERATING_SCENE",
            WorkflowStage::GeneratingAnimation => "GENERATING_ANIMATION",
            WorkflowStage::Completed => "COMPLETED",
            WorkflowStage::Failed => "FAILED",
        }
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl FromStr for WorkflowStage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(WorkflowStage::Queued),
            "GENERATING_AVATAR" => Ok(WorkflowStage::GeneratingAvatar),
            "GENERATING_SCENE" => Ok(WorkflowStage::GeneratingScene),
            "GENERATING_ANIMATION" => Ok(WorkflowStage::GeneratingAnimation),
            "COMPLETED" => Ok(WorkflowStage::Completed),
            "FAILED" => Ok(WorkflowStage::Failed),
            other => Err(anyhow!("unknown workflow stage: {other}")),
        }
    }
}

/// ワークフロー実行の永続ログ（再開とステータス照会に使う）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub kind: WorkflowKind,
    pub input: serde_json::Value,
    pub status: ExecutionStatus,
    pub current_stage: WorkflowStage,
    pub checkpoint: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkflowRun {
    pub id: String,
    pub kind: WorkflowKind,
    pub input: serde_json::Value,
}

/// 終了したワークフロー実行の記録内容。
#[derive(Debug, Clone, PartialEq)]
pub struct RunClosure {
    pub status: ExecutionStatus,
    pub stage: WorkflowStage,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}
