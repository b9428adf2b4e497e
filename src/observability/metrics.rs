/// Prometheusメトリクス定義。
use prometheus::{
    Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
    register_counter_vec_with_registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_vec_with_registry,
};
use std::sync::Arc;

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    /// ステージの結果（stage, outcome）
    pub stage_outcomes: CounterVec,
    /// プロバイダへのポーリング回数（stage）
    pub provider_polls: CounterVec,
    pub heartbeats: Counter,
    /// アクティビティの再試行（activity）
    pub activity_retries: CounterVec,
    /// 補償アクション（action, outcome）
    pub compensation_actions: CounterVec,
    /// Job Record の失敗書き込み自体が失敗した回数。アラート対象。
    pub bookkeeping_failures: Counter,
    /// ワークフローの終了（kind, status）
    pub workflow_outcomes: CounterVec,

    // ヒストグラム
    pub stage_duration: HistogramVec,
    pub workflow_duration: HistogramVec,

    // ゲージ
    pub live_workflows: Gauge,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成する。
    ///
    /// # Errors
    /// 同名のメトリクスが既に登録されている場合はエラーを返す。
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            stage_outcomes: register_counter_vec_with_registry!(
                Opts::new(
                    "comic_stage_outcomes_total",
                    "Stage activity executions by stage and outcome"
                ),
                &["stage", "outcome"],
                registry
            )?,
            provider_polls: register_counter_vec_with_registry!(
                Opts::new(
                    "comic_provider_polls_total",
                    "Provider status polls by stage"
                ),
                &["stage"],
                registry
            )?,
            heartbeats: register_counter_with_registry!(
                "comic_activity_heartbeats_total",
                "Heartbeats emitted by running activities",
                registry
            )?,
            activity_retries: register_counter_vec_with_registry!(
                Opts::new(
                    "comic_activity_retries_total",
                    "Activity attempts retried after a retryable failure"
                ),
                &["activity"],
                registry
            )?,
            compensation_actions: register_counter_vec_with_registry!(
                Opts::new(
                    "comic_compensation_actions_total",
                    "Compensation actions by action and outcome"
                ),
                &["action", "outcome"],
                registry
            )?,
            bookkeeping_failures: register_counter_with_registry!(
                "comic_bookkeeping_failures_total",
                "Job record failure writes that could not be persisted",
                registry
            )?,
            workflow_outcomes: register_counter_vec_with_registry!(
                Opts::new(
                    "comic_workflow_outcomes_total",
                    "Closed workflow executions by kind and status"
                ),
                &["kind", "status"],
                registry
            )?,
            stage_duration: register_histogram_vec_with_registry!(
                HistogramOpts::new(
                    "comic_stage_duration_seconds",
                    "Wall-clock duration of stage activity attempts"
                )
                .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0]),
                &["stage"],
                registry
            )?,
            workflow_duration: register_histogram_vec_with_registry!(
                HistogramOpts::new(
                    "comic_workflow_duration_seconds",
                    "Wall-clock duration of workflow executions"
                )
                .buckets(vec![5.0, 30.0, 60.0, 300.0, 600.0, 900.0, 1800.0]),
                &["kind"],
                registry
            )?,
            live_workflows: register_gauge_with_registry!(
                "comic_live_workflows",
                "Workflow executions currently running in this process",
                registry
            )?,
        })
    }
}
