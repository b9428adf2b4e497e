use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::{JobDao, WorkflowRunDao};
use crate::store::{
    RecordStateError,
    models::{
        JobKind, JobRecord, JobStatus, NewJobRecord, NewWorkflowRun, RunClosure, WorkflowRun,
        WorkflowStage,
    },
};

const SCHEMA_SQL: &str = include_str!("../../../migrations/0001_comic_jobs.sql");

const JOB_COLUMNS: &str = "id, owner_id, status, provider_job_id, provider_submitted_at, \
     asset_key, result_url, error_text, input_url, parent_id, params, idempotency_key, \
     created_at, updated_at";

const RUN_COLUMNS: &str = "id, kind, input, status, current_stage, checkpoint, result, error, \
     created_at, updated_at, closed_at";

/// PostgreSQL 上の Job Record / ワークフロー実行ログ。
#[derive(Debug, Clone)]
pub struct PgComicDao {
    pool: PgPool,
}

impl PgComicDao {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// スキーマを作成する（何度実行しても同じ結果になる）。
    ///
    /// # Errors
    /// DDL の実行に失敗した場合はエラーを返す。
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .context("failed to apply comic job schema")?;
        Ok(())
    }

    /// 更新が0行だった場合に、理由を判定するため現在のレコードを読む。
    async fn existing(&self, kind: JobKind, id: Uuid) -> Result<JobRecord> {
        self.get_record(kind, id)
            .await?
            .ok_or_else(|| RecordStateError::NotFound { kind, id }.into())
    }
}

fn record_from_row(kind: JobKind, row: &PgRow) -> Result<JobRecord> {
    let status: String = row.try_get("status")?;
    Ok(JobRecord {
        id: row.try_get("id")?,
        kind,
        owner_id: row.try_get("owner_id")?,
        status: status.parse()?,
        provider_job_id: row.try_get("provider_job_id")?,
        provider_submitted_at: row.try_get("provider_submitted_at")?,
        asset_key: row.try_get("asset_key")?,
        result_url: row.try_get("result_url")?,
        error_text: row.try_get("error_text")?,
        input_url: row.try_get("input_url")?,
        parent_id: row.try_get("parent_id")?,
        params: row.try_get("params")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<WorkflowRun> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let stage: String = row.try_get("current_stage")?;
    Ok(WorkflowRun {
        id: row.try_get("id")?,
        kind: kind.parse()?,
        input: row.try_get("input")?,
        status: status.parse()?,
        current_stage: stage.parse()?,
        checkpoint: row.try_get("checkpoint")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        closed_at: row.try_get("closed_at")?,
    })
}

#[async_trait]
impl JobDao for PgComicDao {
    async fn create_record(&self, new: NewJobRecord) -> Result<JobRecord> {
        let kind = new.kind;
        let sql = format!(
            "INSERT INTO {table} (id, owner_id, status, input_url, parent_id, params, idempotency_key)
             VALUES ($1, $2, 'queued', $3, $4, $5, $6)
             ON CONFLICT (idempotency_key) DO NOTHING
             RETURNING {JOB_COLUMNS}",
            table = kind.table()
        );
        let inserted = sqlx::query(&sql)
            .bind(Uuid::now_v7())
            .bind(&new.owner_id)
            .bind(new.input_url.as_deref())
            .bind(new.parent_id)
            .bind(&new.params)
            .bind(new.idempotency_key.as_deref())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to insert {kind} job record"))?;

        if let Some(row) = inserted {
            return record_from_row(kind, &row);
        }

        let key = new
            .idempotency_key
            .as_deref()
            .ok_or_else(|| anyhow!("{kind} job insert returned no row"))?;
        self.find_by_key(kind, key)
            .await?
            .ok_or_else(|| anyhow!("{kind} job with key {key} vanished after conflict"))
    }

    async fn get_record(&self, kind: JobKind, id: Uuid) -> Result<Option<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {table} WHERE id = $1",
            table = kind.table()
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load {kind} job {id}"))?;
        row.map(|row| record_from_row(kind, &row)).transpose()
    }

    async fn find_by_key(&self, kind: JobKind, key: &str) -> Result<Option<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {table} WHERE idempotency_key = $1",
            table = kind.table()
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load {kind} job by key {key}"))?;
        row.map(|row| record_from_row(kind, &row)).transpose()
    }

    async fn mark_processing(&self, kind: JobKind, id: Uuid) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET status = 'processing', updated_at = NOW()
             WHERE id = $1 AND status IN ('queued', 'processing')",
            table = kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to mark {kind} job {id} processing"))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        let record = self.existing(kind, id).await?;
        Err(RecordStateError::Terminal {
            kind,
            id,
            status: record.status,
        }
        .into())
    }

    async fn set_provider_job_id(
        &self,
        kind: JobKind,
        id: Uuid,
        handle: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {table}
             SET provider_job_id = $2,
                 provider_submitted_at = COALESCE(provider_submitted_at, $3),
                 updated_at = NOW()
             WHERE id = $1
               AND status IN ('queued', 'processing')
               AND (provider_job_id IS NULL OR provider_job_id = $2)",
            table = kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(handle)
            .bind(submitted_at)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to record provider job id for {kind} job {id}"))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        let record = self.existing(kind, id).await?;
        if record.status.is_terminal() {
            return Err(RecordStateError::Terminal {
                kind,
                id,
                status: record.status,
            }
            .into());
        }
        Err(anyhow!(
            "{kind} job {id} already anchored to provider job {}",
            record.provider_job_id.unwrap_or_default()
        ))
    }

    async fn set_asset_key(&self, kind: JobKind, id: Uuid, key: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET asset_key = $2, updated_at = NOW()
             WHERE id = $1 AND status IN ('queued', 'processing')",
            table = kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to record asset key for {kind} job {id}"))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        let record = self.existing(kind, id).await?;
        Err(RecordStateError::Terminal {
            kind,
            id,
            status: record.status,
        }
        .into())
    }

    async fn mark_completed(&self, kind: JobKind, id: Uuid, result_url: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {table}
             SET status = 'completed', result_url = $2, error_text = NULL, updated_at = NOW()
             WHERE id = $1 AND status = 'processing'",
            table = kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(result_url)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to mark {kind} job {id} completed"))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        let record = self.existing(kind, id).await?;
        if record.status == JobStatus::Completed
            && record.result_url.as_deref() == Some(result_url)
        {
            return Ok(());
        }
        if record.status.is_terminal() {
            return Err(RecordStateError::Terminal {
                kind,
                id,
                status: record.status,
            }
            .into());
        }
        Err(anyhow!(
            "{kind} job {id} cannot complete from {}",
            record.status
        ))
    }

    async fn mark_failed(&self, kind: JobKind, id: Uuid, error_text: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE {table}
             SET status = 'failed', error_text = $2, result_url = NULL, updated_at = NOW()
             WHERE id = $1 AND status IN ('queued', 'processing')",
            table = kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(error_text)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to mark {kind} job {id} failed"))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.existing(kind, id).await.map(|_| false)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping failed")?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowRunDao for PgComicDao {
    async fn insert_run(&self, run: NewWorkflowRun) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO workflow_runs (id, kind, input, status, current_stage)
            VALUES ($1, $2, $3, 'RUNNING', 'QUEUED')
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(&run.id)
        .bind(run.kind.as_ref())
        .bind(&run.input)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert workflow run {}", run.id))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_run(&self, id: &str) -> Result<Option<WorkflowRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load workflow run {id}"))?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn record_stage(
        &self,
        id: &str,
        stage: WorkflowStage,
        checkpoint: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE workflow_runs
            SET current_stage = $2, checkpoint = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'RUNNING'
            ",
        )
        .bind(id)
        .bind(stage.as_ref())
        .bind(checkpoint)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record stage {stage} for workflow run {id}"))?;
        Ok(())
    }

    async fn close_run(&self, id: &str, closure: RunClosure) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE workflow_runs
            SET status = $2, current_stage = $3, result = $4, error = $5,
                closed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'RUNNING'
            ",
        )
        .bind(id)
        .bind(closure.status.as_ref())
        .bind(closure.stage.as_ref())
        .bind(closure.result.as_ref())
        .bind(closure.error.as_deref())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to close workflow run {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_running(&self) -> Result<Vec<WorkflowRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE status = 'RUNNING' ORDER BY created_at"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("failed to list running workflow runs")?;
        rows.iter().map(run_from_row).collect()
    }

    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM workflow_runs
            WHERE closed_at IS NOT NULL AND closed_at < $1
            ",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("failed to purge closed workflow runs")?;
        Ok(result.rows_affected())
    }
}
