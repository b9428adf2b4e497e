use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::Activities;
use crate::{
    activity::{ActivityContext, ActivityError},
    clients::{PollOutcome, ProviderAdapter, ProviderError, StageParams, provider::output_url},
    storage::keys::asset_key,
    store::models::{JobKind, JobRecord, JobStatus},
    util::{error::is_retryable_bookkeeping, retry::RetryConfig, text::truncate_error_message},
};

/// 一時的なポーリング失敗をこの回数まではループ内で吸収する。
const MAX_CONSECUTIVE_POLL_ERRORS: u32 = 3;

/// 実行対象の Job Record。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StageJob {
    pub(crate) kind: JobKind,
    pub(crate) id: Uuid,
    pub(crate) owner_id: String,
}

impl Activities {
    /// ステージ1回分を実行し、公開URLを返す。
    ///
    /// processing 化に失敗した場合はプロバイダを呼ばずにそのまま返す。それ以降の失敗は
    /// 再試行されない（または最終試行の）場合に限り failed を記録する。その試行が
    /// アップロードしたアセットは、再試行の有無にかかわらず削除してから返す。
    pub(crate) async fn run_stage(
        &self,
        ctx: &ActivityContext,
        job: &StageJob,
        params: &StageParams,
    ) -> Result<String, ActivityError> {
        let started = Instant::now();
        let kind = job.kind;

        let record = self
            .jobs
            .get_record(kind, job.id)
            .await
            .map_err(ActivityError::bookkeeping)?
            .ok_or_else(|| ActivityError::Validation(format!("{kind} job {} not found", job.id)))?;

        if record.owner_id != job.owner_id {
            return Err(ActivityError::Validation(format!(
                "{kind} job {} does not belong to owner {}",
                job.id, job.owner_id
            )));
        }

        if record.status == JobStatus::Completed {
            if let Some(url) = record.result_url.clone() {
                info!(
                    workflow_id = ctx.workflow_id(),
                    stage = %kind,
                    job_id = %job.id,
                    "stage already completed, returning stored result"
                );
                return Ok(url);
            }
        }

        self.jobs
            .mark_processing(kind, job.id)
            .await
            .map_err(ActivityError::bookkeeping)?;
        ctx.heartbeat("processing");

        let mut uploaded = None;
        let outcome = self.generate(ctx, &record, params, &mut uploaded).await;
        let elapsed = started.elapsed().as_secs_f64();
        self.metrics
            .stage_duration
            .with_label_values(&[kind.as_ref()])
            .observe(elapsed);

        match outcome {
            Ok(url) => {
                self.metrics
                    .stage_outcomes
                    .with_label_values(&[kind.as_ref(), "completed"])
                    .inc();
                info!(
                    workflow_id = ctx.workflow_id(),
                    stage = %kind,
                    job_id = %job.id,
                    result_url = %url,
                    elapsed_secs = elapsed,
                    "stage completed"
                );
                Ok(url)
            }
            Err(failure) => {
                self.record_failure(ctx, job, &failure, uploaded).await;
                Err(failure)
            }
        }
    }

    async fn generate(
        &self,
        ctx: &ActivityContext,
        record: &JobRecord,
        params: &StageParams,
        uploaded: &mut Option<String>,
    ) -> Result<String, ActivityError> {
        let kind = record.kind;
        let provider = self.providers.for_kind(kind);

        let (handle, submitted_at) = if let Some(existing) = record.provider_job_id.clone() {
            let submitted_at = record.provider_submitted_at.unwrap_or_else(|| {
                warn!(
                    stage = %kind,
                    job_id = %record.id,
                    "provider job has no recorded submission time, polling with a full budget"
                );
                self.clock.now()
            });
            info!(
                workflow_id = ctx.workflow_id(),
                stage = %kind,
                job_id = %record.id,
                provider_job_id = %existing,
                submitted_at = %submitted_at,
                "resuming provider job"
            );
            (existing, submitted_at)
        } else {
            let submitted_at = self.clock.now();
            let handle = provider
                .start(params)
                .await
                .map_err(ActivityError::from_submission)?;
            ctx.heartbeat("submitted");
            self.anchor_provider_job(record, &handle, submitted_at).await;
            (handle, submitted_at)
        };

        let output = self
            .poll_until_done(ctx, kind, provider, &handle, submitted_at)
            .await?;
        let source_url = output_url(&output).map_err(ActivityError::InvalidOutput)?;

        ctx.heartbeat("downloading");
        let asset = self
            .fetcher
            .fetch(&source_url, &|_: usize| ctx.heartbeat("downloading"))
            .await
            .map_err(ActivityError::Transfer)?;
        if asset.body.is_empty() {
            return Err(ActivityError::InvalidOutput(format!(
                "downloaded {kind} output is empty"
            )));
        }

        let content_type = asset
            .content_type
            .as_deref()
            .map(|raw| raw.split(';').next().unwrap_or_default().trim().to_string())
            .filter(|ct| ct.starts_with("image/") || ct.starts_with("video/"))
            .unwrap_or_else(|| kind.default_content_type().to_string());
        let key = asset_key(&record.owner_id, record.id, kind, &content_type);

        self.jobs
            .set_asset_key(kind, record.id, &key)
            .await
            .map_err(ActivityError::bookkeeping)?;
        ctx.heartbeat("uploading");
        let stored = self
            .assets
            .put(&key, asset.body, &content_type)
            .await
            .map_err(ActivityError::Storage)?;
        *uploaded = Some(stored.clone());
        ctx.heartbeat("uploaded");

        let url = self.assets.public_url(&stored).unwrap_or_else(|| {
            warn!(
                stage = %kind,
                job_id = %record.id,
                key = %stored,
                "public asset URL is not configured, publishing the bare key"
            );
            stored.clone()
        });

        self.jobs
            .mark_completed(kind, record.id, &url)
            .await
            .map_err(ActivityError::bookkeeping)?;
        Ok(url)
    }

    /// プロバイダのジョブIDを記録する。
    ///
    /// 生成依頼は冪等ではないため、記録に失敗しても依頼し直さずにポーリングを続ける。
    async fn anchor_provider_job(
        &self,
        record: &JobRecord,
        handle: &str,
        submitted_at: DateTime<Utc>,
    ) {
        let retry = RetryConfig::default();
        let result = retry
            .run("record provider job id", is_retryable_bookkeeping, || {
                self.jobs
                    .set_provider_job_id(record.kind, record.id, handle, submitted_at)
            })
            .await;

        if let Err(err) = result {
            self.metrics.bookkeeping_failures.inc();
            error!(
                critical = true,
                stage = %record.kind,
                job_id = %record.id,
                provider_job_id = handle,
                error = %err,
                "failed to record provider job id; continuing without a recovery anchor"
            );
        }
    }

    async fn poll_until_done(
        &self,
        ctx: &ActivityContext,
        kind: JobKind,
        provider: &Arc<dyn ProviderAdapter>,
        handle: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<Value, ActivityError> {
        let timing = self.timings.for_kind(kind);
        // 上限は試行ごとではなく依頼時刻から数える。
        let deadline = Instant::now() + self.clock.remaining(submitted_at, timing.ceiling);
        let mut consecutive_errors = 0;

        loop {
            self.metrics
                .provider_polls
                .with_label_values(&[kind.as_ref()])
                .inc();

            match provider.poll(handle).await {
                Ok(PollOutcome::Succeeded(output)) => return Ok(output),
                Ok(PollOutcome::Failed(message)) => {
                    return Err(ActivityError::ProviderFailed(message));
                }
                Ok(PollOutcome::Canceled(message)) => {
                    return Err(ActivityError::ProviderFailed(format!("canceled: {message}")));
                }
                Ok(PollOutcome::Pending) => {
                    consecutive_errors = 0;
                    ctx.heartbeat("pending");
                    debug!(stage = %kind, provider_job_id = handle, "provider job pending");
                }
                Err(ProviderError::Transport(err))
                    if consecutive_errors < MAX_CONSECUTIVE_POLL_ERRORS =>
                {
                    consecutive_errors += 1;
                    ctx.heartbeat("poll error");
                    warn!(
                        stage = %kind,
                        provider_job_id = handle,
                        consecutive_errors,
                        error = %format!("{err:#}"),
                        "transient provider poll failure"
                    );
                }
                Err(err) => return Err(ActivityError::from_poll(err)),
            }

            if Instant::now() >= deadline {
                return Err(ActivityError::PollTimeout {
                    stage: kind,
                    ceiling: timing.ceiling,
                });
            }
            sleep(timing.poll_interval).await;
        }
    }

    async fn record_failure(
        &self,
        ctx: &ActivityContext,
        job: &StageJob,
        failure: &ActivityError,
        uploaded: Option<String>,
    ) {
        let kind = job.kind;
        let terminal = !failure.is_retryable() || ctx.is_final_attempt();
        let outcome = if terminal { "failed" } else { "retrying" };
        self.metrics
            .stage_outcomes
            .with_label_values(&[kind.as_ref(), outcome])
            .inc();

        // 次の試行は同じキーにアップロードし直す。
        if let Some(key) = uploaded {
            self.discard_upload(job, &key).await;
        }

        if !terminal {
            warn!(
                workflow_id = ctx.workflow_id(),
                stage = %kind,
                job_id = %job.id,
                attempt = ctx.attempt(),
                category = failure.category(),
                error = %failure,
                "stage attempt failed, leaving record for retry"
            );
            return;
        }

        let error_text = truncate_error_message(&failure.to_string());
        match self.jobs.mark_failed(kind, job.id, &error_text).await {
            Ok(true) => info!(
                workflow_id = ctx.workflow_id(),
                stage = %kind,
                job_id = %job.id,
                category = failure.category(),
                error = %failure,
                "stage failed"
            ),
            Ok(false) => debug!(stage = %kind, job_id = %job.id, "record already terminal"),
            Err(err) => {
                self.metrics.bookkeeping_failures.inc();
                error!(
                    critical = true,
                    workflow_id = ctx.workflow_id(),
                    stage = %kind,
                    job_id = %job.id,
                    original_error = %failure,
                    error = %format!("{err:#}"),
                    "failed to record stage failure"
                );
            }
        }
    }

    /// 失敗した試行がアップロードしたアセットを消す。
    ///
    /// 完了の記録だけは書けていた場合や、レコードを読めない場合は残す。
    async fn discard_upload(&self, job: &StageJob, key: &str) {
        let kind = job.kind;
        match self.jobs.get_record(kind, job.id).await {
            Ok(Some(record)) if record.status == JobStatus::Completed => {
                debug!(stage = %kind, job_id = %job.id, key, "record completed, keeping upload");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    stage = %kind,
                    job_id = %job.id,
                    key,
                    error = %format!("{err:#}"),
                    "could not confirm record state, keeping upload for compensation"
                );
                return;
            }
        }

        if let Err(err) = self.assets.delete(key).await {
            warn!(
                stage = %kind,
                job_id = %job.id,
                key,
                error = %format!("{err:#}"),
                "failed to delete asset uploaded by a failed attempt"
            );
        }
    }
}
