//! ワークフロー（Avatar / Scene+Animation）と、それを駆動するエンジン。
//!
//! ワークフロー本体はアクティビティ呼び出しごとに中断し、失敗時は補償アクティビティを
//! 決まった順に実行してから元のエラーを返す。

pub mod avatar;
pub mod engine;
pub mod scene;

use std::{future::Future, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

pub use self::avatar::AvatarWorkflowInput;
pub use self::engine::{EngineError, EngineSettings, WorkflowEngine};
pub use self::scene::{SceneWorkflowInput, SceneWorkflowResult};
use crate::{
    activity::{ActivityContext, ActivityError, run_activity},
    stages::Activities,
    store::{
        dao::WorkflowRunDao,
        models::{ExecutionStatus, WorkflowRun, WorkflowStage},
    },
};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Activity(#[from] ActivityError),
    #[error("workflow execution exceeded {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("workflow was canceled")]
    Canceled,
    #[error("invalid workflow input: {0}")]
    Input(String),
    #[error("workflow failed: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// 実行の終了状態。
    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Activity(_) | Self::Input(_) | Self::Internal(_) => ExecutionStatus::Failed,
            Self::TimedOut(_) => ExecutionStatus::TimedOut,
            Self::Canceled => ExecutionStatus::Canceled,
        }
    }
}

/// 現在のステージ。前にしか進まず、終端に達したら動かない。
#[derive(Debug, Clone)]
pub struct StageTracker {
    tx: Arc<watch::Sender<WorkflowStage>>,
}

impl StageTracker {
    #[must_use]
    pub fn new(initial: WorkflowStage) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// ステージを進める。後退や終端からの遷移は無視して false を返す。
    pub fn advance(&self, next: WorkflowStage) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_terminal() || next == *current || next.rank() < current.rank() {
                return false;
            }
            *current = next;
            true
        })
    }

    #[must_use]
    pub fn current(&self) -> WorkflowStage {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WorkflowStage> {
        self.tx.subscribe()
    }
}

/// ステータス照会の応答。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDescription {
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowDescription {
    /// 実行ログから応答を組み立てる。実行中は `live_stage` を優先する。
    #[must_use]
    pub fn from_run(run: &WorkflowRun, live_stage: Option<WorkflowStage>) -> Self {
        let status = run.status;
        match status {
            ExecutionStatus::Running => Self {
                status,
                current_stage: Some(live_stage.unwrap_or(run.current_stage).to_string()),
                result: None,
                error: None,
            },
            ExecutionStatus::Completed => Self {
                status,
                current_stage: Some(WorkflowStage::Completed.to_string()),
                result: run.result.clone(),
                error: None,
            },
            ExecutionStatus::Failed | ExecutionStatus::TimedOut => Self {
                status,
                current_stage: Some(WorkflowStage::Failed.to_string()),
                result: None,
                error: Some(format!(
                    "Workflow {status}: {}",
                    run.error.as_deref().unwrap_or("unknown error")
                )),
            },
            ExecutionStatus::Terminated | ExecutionStatus::Canceled => Self {
                status,
                current_stage: Some(status.to_string()),
                result: None,
                error: run.error.clone(),
            },
        }
    }
}

/// 1回のワークフロー実行が使う環境。
pub(crate) struct WorkflowContext {
    pub(crate) id: String,
    pub(crate) activities: Activities,
    pub(crate) runs: Arc<dyn WorkflowRunDao>,
    pub(crate) settings: EngineSettings,
    pub(crate) stage: StageTracker,
    pub(crate) cancel: CancellationToken,
    pub(crate) deadline: Instant,
}

impl WorkflowContext {
    /// ステージアクティビティを呼ぶ。キャンセルと実行タイムアウトで中断される。
    pub(crate) async fn call<T, F, Fut>(
        &self,
        activity: &'static str,
        body: F,
    ) -> Result<T, WorkflowError>
    where
        F: FnMut(ActivityContext) -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        let metrics = self.activities.metrics();
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(WorkflowError::Canceled),
            () = sleep_until(self.deadline) => {
                Err(WorkflowError::TimedOut(self.settings.execution_timeout))
            }
            result = run_activity(activity, &self.id, &self.settings.stage_options, metrics, body) => {
                result.map_err(WorkflowError::from)
            }
        }
    }

    /// 補償アクティビティを実行する。失敗しても後続の補償は続けるため結果は bool で返す。
    pub(crate) async fn compensate<T, F, Fut>(&self, action: &'static str, body: F) -> bool
    where
        F: FnMut(ActivityContext) -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        let metrics = self.activities.metrics();
        let result = run_activity(
            action,
            &self.id,
            &self.settings.compensation_options,
            metrics,
            body,
        )
        .await;

        match result {
            Ok(_) => {
                metrics
                    .compensation_actions
                    .with_label_values(&[action, "succeeded"])
                    .inc();
                true
            }
            Err(err) => {
                metrics
                    .compensation_actions
                    .with_label_values(&[action, "failed"])
                    .inc();
                if matches!(err, ActivityError::Bookkeeping(_)) {
                    metrics.bookkeeping_failures.inc();
                    error!(
                        critical = true,
                        workflow_id = %self.id,
                        action,
                        error = %err,
                        "compensation could not update job record"
                    );
                } else {
                    warn!(workflow_id = %self.id, action, error = %err, "compensation failed");
                }
                false
            }
        }
    }

    /// ステージを進め、チェックポイントを記録する。記録に失敗しても実行は続ける。
    pub(crate) async fn advance(&self, stage: WorkflowStage, checkpoint: &Value) {
        if !self.stage.advance(stage) {
            return;
        }
        if let Err(err) = self.runs.record_stage(&self.id, stage, checkpoint).await {
            warn!(
                workflow_id = %self.id,
                stage = %stage,
                error = %format!("{err:#}"),
                "failed to checkpoint workflow stage"
            );
        }
    }

    /// 補償後の失敗状態に移す。終了時の記録は実行ログの close で行う。
    pub(crate) fn fail(&self) {
        self.stage.advance(WorkflowStage::Failed);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::store::models::WorkflowKind;

    fn run(status: ExecutionStatus, error: Option<&str>) -> WorkflowRun {
        WorkflowRun {
            id: "scene-a-city-1".into(),
            kind: WorkflowKind::SceneAnimation,
            input: json!({}),
            status,
            current_stage: WorkflowStage::GeneratingAnimation,
            checkpoint: json!({}),
            result: None,
            error: error.map(str::to_string),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn tracker_never_moves_backwards() {
        let tracker = StageTracker::new(WorkflowStage::Queued);
        assert!(tracker.advance(WorkflowStage::GeneratingScene));
        assert!(tracker.advance(WorkflowStage::GeneratingAnimation));
        assert!(!tracker.advance(WorkflowStage::GeneratingScene));
        assert!(tracker.advance(WorkflowStage::Failed));
        assert!(!tracker.advance(WorkflowStage::Completed));
        assert_eq!(tracker.current(), WorkflowStage::Failed);
    }

    #[test]
    fn running_description_prefers_live_stage() {
        let description = WorkflowDescription::from_run(
            &run(ExecutionStatus::Running, None),
            Some(WorkflowStage::GeneratingScene),
        );
        assert_eq!(description.current_stage.as_deref(), Some("GENERATING_SCENE"));
        assert!(description.error.is_none());
    }

    #[test]
    fn timed_out_runs_report_failed_stage_with_cause() {
        let description = WorkflowDescription::from_run(
            &run(ExecutionStatus::TimedOut, Some("workflow execution exceeded 1800s")),
            None,
        );
        assert_eq!(description.current_stage.as_deref(), Some("FAILED"));
        assert_eq!(
            description.error.as_deref(),
            Some("Workflow TIMED_OUT: workflow execution exceeded 1800s")
        );
    }

    #[test]
    fn canceled_runs_report_status_as_stage() {
        let description =
            WorkflowDescription::from_run(&run(ExecutionStatus::Canceled, None), None);
        assert_eq!(description.current_stage.as_deref(), Some("CANCELED"));
    }
}
