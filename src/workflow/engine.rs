//! ワークフロー実行の起動・照会・制御。
//!
//! 実行ごとに tokio タスクを1つ起動し、プロセス内の実行表で現在ステージと制御ハンドルを
//! 保持する。状態は `workflow_runs` に記録し、再起動時は RUNNING の実行を再開する。

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::Utc;
use prometheus::Gauge;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::watch,
    task::AbortHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{
    StageTracker, WorkflowContext, WorkflowDescription, WorkflowError,
    avatar::{self, AvatarWorkflowInput},
    scene::{self, SceneCheckpoint, SceneWorkflowInput},
};
use crate::{
    activity::{ActivityOptions, RetryPolicy},
    config::Config,
    stages::Activities,
    store::{
        dao::WorkflowRunDao,
        models::{ExecutionStatus, NewWorkflowRun, RunClosure, WorkflowKind, WorkflowStage},
    },
};

/// エンジンの実行ポリシー。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    pub stage_options: ActivityOptions,
    pub compensation_options: ActivityOptions,
    pub execution_timeout: Duration,
    pub delete_avatar_on_failure: bool,
}

impl EngineSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            stage_options: ActivityOptions::stage(config),
            compensation_options: ActivityOptions::compensation(config),
            execution_timeout: config.workflow_execution_timeout(),
            delete_avatar_on_failure: config.delete_avatar_on_failure(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        let stage_options = ActivityOptions::default();
        Self {
            stage_options,
            compensation_options: ActivityOptions {
                start_to_close: Duration::from_secs(30),
                heartbeat_timeout: None,
                retry: RetryPolicy {
                    maximum_attempts: 2,
                    ..stage_options.retry
                },
            },
            execution_timeout: Duration::from_secs(30 * 60),
            delete_avatar_on_failure: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow {0} already exists")]
    AlreadyExists(String),
    #[error("workflow {0} not found")]
    NotFound(String),
    #[error("workflow {0} is already closed")]
    Closed(String),
    #[error("workflow {0} is not running in this process")]
    NotLive(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// 実行中のワークフローの制御ハンドル。
struct LiveRun {
    kind: WorkflowKind,
    stage: StageTracker,
    cancel: CancellationToken,
    abort: Option<AbortHandle>,
    closed: Arc<watch::Sender<Option<ExecutionStatus>>>,
}

/// 実行タスクが終了（中断を含む）したときに実行数ゲージを戻す。
struct LiveGuard(Gauge);

impl LiveGuard {
    fn new(gauge: Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

struct Launch {
    id: String,
    kind: WorkflowKind,
    input: Value,
    checkpoint: Value,
    stage: WorkflowStage,
    remaining: Duration,
}

struct EngineInner {
    activities: Activities,
    runs: Arc<dyn WorkflowRunDao>,
    settings: EngineSettings,
    live: Mutex<HashMap<String, LiveRun>>,
}

/// ワークフローエンジン。
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    #[must_use]
    pub fn new(
        activities: Activities,
        runs: Arc<dyn WorkflowRunDao>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                activities,
                runs,
                settings,
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, LiveRun>> {
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Avatar ワークフローを `avatar-<id>` として起動する。
    ///
    /// # Errors
    /// 同じIDの実行が既にある場合、または実行ログへの登録に失敗した場合。
    pub async fn start_avatar(&self, input: AvatarWorkflowInput) -> Result<String, EngineError> {
        let id = avatar::workflow_id(input.avatar_id);
        let input = serde_json::to_value(&input).map_err(anyhow::Error::from)?;
        self.start(id, WorkflowKind::Avatar, input).await
    }

    /// Scene+Animation ワークフローを起動する。
    ///
    /// # Errors
    /// 同じIDの実行が既にある場合、または実行ログへの登録に失敗した場合。
    pub async fn start_scene(&self, input: SceneWorkflowInput) -> Result<String, EngineError> {
        let id = scene::workflow_id(
            input.avatar_id,
            &input.theme,
            Utc::now().timestamp_millis(),
        );
        let input = serde_json::to_value(&input).map_err(anyhow::Error::from)?;
        self.start(id, WorkflowKind::SceneAnimation, input).await
    }

    async fn start(
        &self,
        id: String,
        kind: WorkflowKind,
        input: Value,
    ) -> Result<String, EngineError> {
        let inserted = self
            .inner
            .runs
            .insert_run(NewWorkflowRun {
                id: id.clone(),
                kind,
                input: input.clone(),
            })
            .await?;
        if !inserted {
            return Err(EngineError::AlreadyExists(id));
        }

        self.launch(Launch {
            id: id.clone(),
            kind,
            input,
            checkpoint: Value::Null,
            stage: WorkflowStage::Queued,
            remaining: self.inner.settings.execution_timeout,
        });
        info!(workflow_id = %id, kind = kind.as_ref(), "workflow started");
        Ok(id)
    }

    fn launch(&self, launch: Launch) {
        let tracker = StageTracker::new(launch.stage);
        let cancel = CancellationToken::new();
        let (closed, _) = watch::channel(None);
        let closed = Arc::new(closed);

        self.live().insert(
            launch.id.clone(),
            LiveRun {
                kind: launch.kind,
                stage: tracker.clone(),
                cancel: cancel.clone(),
                abort: None,
                closed: Arc::clone(&closed),
            },
        );

        let ctx = WorkflowContext {
            id: launch.id.clone(),
            activities: self.inner.activities.clone(),
            runs: Arc::clone(&self.inner.runs),
            settings: self.inner.settings,
            stage: tracker,
            cancel,
            deadline: Instant::now() + launch.remaining,
        };

        let engine = self.clone();
        let kind = launch.kind;
        let input = launch.input;
        let checkpoint = launch.checkpoint;
        let handle = tokio::spawn(async move {
            engine.drive(ctx, kind, input, checkpoint, closed).await;
        });

        if let Some(entry) = self.live().get_mut(&launch.id) {
            entry.abort = Some(handle.abort_handle());
        }
    }

    async fn drive(
        &self,
        ctx: WorkflowContext,
        kind: WorkflowKind,
        input: Value,
        checkpoint: Value,
        closed: Arc<watch::Sender<Option<ExecutionStatus>>>,
    ) {
        let metrics = self.inner.activities.metrics();
        let _guard = LiveGuard::new(metrics.live_workflows.clone());
        let started = Instant::now();

        let outcome = match kind {
            WorkflowKind::Avatar => match serde_json::from_value::<AvatarWorkflowInput>(input) {
                Ok(input) => avatar::run(&ctx, &input).await,
                Err(err) => Err(WorkflowError::Input(err.to_string())),
            },
            WorkflowKind::SceneAnimation => {
                match serde_json::from_value::<SceneWorkflowInput>(input) {
                    Ok(input) => {
                        scene::run(&ctx, &input, SceneCheckpoint::from_value(&checkpoint)).await
                    }
                    Err(err) => Err(WorkflowError::Input(err.to_string())),
                }
            }
        };

        let closure = match outcome {
            Ok(result) => RunClosure {
                status: ExecutionStatus::Completed,
                stage: WorkflowStage::Completed,
                result: Some(result),
                error: None,
            },
            Err(err) => {
                ctx.fail();
                RunClosure {
                    status: err.status(),
                    stage: WorkflowStage::Failed,
                    result: None,
                    error: Some(err.to_string()),
                }
            }
        };
        let status = closure.status;

        match self.inner.runs.close_run(&ctx.id, closure).await {
            Ok(true) => {}
            Ok(false) => warn!(workflow_id = %ctx.id, "workflow run was already closed"),
            Err(err) => error!(
                workflow_id = %ctx.id,
                status = %status,
                error = %format!("{err:#}"),
                "failed to record workflow closure"
            ),
        }

        metrics
            .workflow_outcomes
            .with_label_values(&[kind.as_ref(), status.as_ref()])
            .inc();
        metrics
            .workflow_duration
            .with_label_values(&[kind.as_ref()])
            .observe(started.elapsed().as_secs_f64());
        info!(workflow_id = %ctx.id, status = %status, "workflow closed");

        self.live().remove(&ctx.id);
        mark_closed(&closed, status);
    }

    /// ステータス照会。実行中はプロセス内のステージを返す。
    ///
    /// # Errors
    /// 実行が存在しない場合、または実行ログの読み込みに失敗した場合。
    pub async fn describe(&self, id: &str) -> Result<WorkflowDescription, EngineError> {
        let run = self
            .inner
            .runs
            .get_run(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let live_stage = self.live().get(id).map(|entry| entry.stage.current());
        Ok(WorkflowDescription::from_run(&run, live_stage))
    }

    /// 現在のステージを同期的に返す。プロセス内に無ければ実行ログの値を使う。
    ///
    /// # Errors
    /// 実行が存在しない場合、または実行ログの読み込みに失敗した場合。
    pub async fn query_stage(&self, id: &str) -> Result<WorkflowStage, EngineError> {
        let live_stage = self.live().get(id).map(|entry| entry.stage.current());
        if let Some(stage) = live_stage {
            return Ok(stage);
        }
        self.inner
            .runs
            .get_run(id)
            .await?
            .map(|run| run.current_stage)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// ステージ変化の購読。実行中のワークフローのみ。
    #[must_use]
    pub fn watch_stage(&self, id: &str) -> Option<watch::Receiver<WorkflowStage>> {
        self.live().get(id).map(|entry| entry.stage.subscribe())
    }

    /// 実行の終了を待ち、最終状態を返す。
    ///
    /// # Errors
    /// 実行が存在しない場合、または実行ログの読み込みに失敗した場合。
    pub async fn wait(&self, id: &str) -> Result<WorkflowDescription, EngineError> {
        let closed = self.live().get(id).map(|entry| entry.closed.subscribe());
        if let Some(mut closed) = closed {
            // 送信側が先に閉じても最終値は残っている
            let _ = closed.wait_for(Option::is_some).await;
        }
        self.describe(id).await
    }

    /// キャンセルを要求する。補償を実行してから CANCELED で終了する。
    ///
    /// # Errors
    /// 実行がこのプロセスで動いていない場合。
    pub async fn cancel(&self, id: &str) -> Result<(), EngineError> {
        let token = self.live().get(id).map(|entry| entry.cancel.clone());
        match token {
            Some(token) => {
                info!(workflow_id = id, "workflow cancellation requested");
                token.cancel();
                Ok(())
            }
            None => Err(self.not_live(id).await),
        }
    }

    /// 補償を行わずに即座に終了させる。
    ///
    /// # Errors
    /// 実行が存在しない、既に終了している、または実行ログの更新に失敗した場合。
    pub async fn terminate(&self, id: &str, reason: Option<String>) -> Result<(), EngineError> {
        let entry = self.live().remove(id);

        let (kind, stage) = match &entry {
            Some(entry) => {
                if let Some(abort) = &entry.abort {
                    abort.abort();
                }
                (entry.kind, entry.stage.current())
            }
            None => {
                let run = self
                    .inner
                    .runs
                    .get_run(id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
                if run.status.is_closed() {
                    return Err(EngineError::Closed(id.to_string()));
                }
                (run.kind, run.current_stage)
            }
        };

        let closed = self
            .inner
            .runs
            .close_run(
                id,
                RunClosure {
                    status: ExecutionStatus::Terminated,
                    stage,
                    result: None,
                    error: reason,
                },
            )
            .await?;
        if let Some(entry) = entry {
            mark_closed(&entry.closed, ExecutionStatus::Terminated);
        }
        if !closed {
            return Err(EngineError::Closed(id.to_string()));
        }

        self.inner
            .activities
            .metrics()
            .workflow_outcomes
            .with_label_values(&[kind.as_ref(), ExecutionStatus::Terminated.as_ref()])
            .inc();
        warn!(workflow_id = id, "workflow terminated");
        Ok(())
    }

    async fn not_live(&self, id: &str) -> EngineError {
        match self.inner.runs.get_run(id).await {
            Ok(Some(run)) if run.status.is_closed() => EngineError::Closed(id.to_string()),
            Ok(Some(_)) => EngineError::NotLive(id.to_string()),
            Ok(None) => EngineError::NotFound(id.to_string()),
            Err(err) => EngineError::Store(err),
        }
    }

    /// RUNNING のまま残っている実行を再開する。再開した件数を返す。
    ///
    /// 残り時間は作成時刻から計算し、既に超過していれば最初のアクティビティ呼び出しで
    /// タイムアウトして補償に進む。
    ///
    /// # Errors
    /// 実行ログの読み込みに失敗した場合。
    pub async fn resume_incomplete(&self) -> Result<usize, EngineError> {
        let runs = self.inner.runs.list_running().await?;
        let mut resumed = 0;

        for run in runs {
            if self.live().contains_key(&run.id) {
                continue;
            }
            let age = (Utc::now() - run.created_at).to_std().unwrap_or_default();
            let remaining = self.inner.settings.execution_timeout.saturating_sub(age);
            info!(
                workflow_id = %run.id,
                kind = run.kind.as_ref(),
                stage = %run.current_stage,
                remaining_secs = remaining.as_secs(),
                "resuming workflow"
            );
            self.launch(Launch {
                id: run.id,
                kind: run.kind,
                input: run.input,
                checkpoint: run.checkpoint,
                stage: run.current_stage,
                remaining,
            });
            resumed += 1;
        }

        Ok(resumed)
    }

    /// プロセス内で実行中のワークフロー数。
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live().len()
    }
}

fn mark_closed(closed: &watch::Sender<Option<ExecutionStatus>>, status: ExecutionStatus) {
    closed.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(status);
        true
    });
}
