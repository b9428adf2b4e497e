//! 終了済みワークフロー実行の保持期限切れ削除。

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{error, info};

use crate::store::dao::WorkflowRunDao;

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub fn spawn_retention_daemon(
    runs: Arc<dyn WorkflowRunDao>,
    retention_days: u32,
) -> JoinHandle<()> {
    RetentionDaemon::new(runs, retention_days, PURGE_INTERVAL).spawn()
}

struct RetentionDaemon {
    runs: Arc<dyn WorkflowRunDao>,
    retention: chrono::Duration,
    interval: Duration,
}

impl RetentionDaemon {
    fn new(runs: Arc<dyn WorkflowRunDao>, retention_days: u32, interval: Duration) -> Self {
        Self {
            runs,
            retention: chrono::Duration::days(i64::from(retention_days)),
            interval,
        }
    }

    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        let state = self;
        loop {
            let now = Utc::now();
            match state.purge_once(now).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged expired workflow runs"),
                Err(err) => error!(error = %format!("{err:#}"), "workflow run purge failed"),
            }
            sleep(state.interval).await;
        }
    }

    async fn purge_once(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        self.runs.purge_closed_before(cutoff(now, self.retention)).await
    }
}

fn cutoff(now: DateTime<Utc>, retention: chrono::Duration) -> DateTime<Utc> {
    now - retention
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::{
        store::models::{ExecutionStatus, NewWorkflowRun, RunClosure, WorkflowKind, WorkflowStage},
        test_support::MemoryDao,
    };

    #[test]
    fn cutoff_subtracts_retention_window() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        assert_eq!(
            cutoff(now, chrono::Duration::days(7)),
            Utc.with_ymd_and_hms(2026, 10, 12, 12, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn purges_only_runs_closed_before_the_window() {
        let dao = Arc::new(MemoryDao::new());
        for id in ["old", "open"] {
            dao.insert_run(NewWorkflowRun {
                id: id.into(),
                kind: WorkflowKind::Avatar,
                input: json!({}),
            })
            .await
            .unwrap();
        }
        dao.close_run(
            "old",
            RunClosure {
                status: ExecutionStatus::Completed,
                stage: WorkflowStage::Completed,
                result: None,
                error: None,
            },
        )
        .await
        .unwrap();

        let daemon = RetentionDaemon::new(dao.clone(), 7, PURGE_INTERVAL);
        let later = Utc::now() + chrono::Duration::days(8);
        assert_eq!(daemon.purge_once(later).await.unwrap(), 1);
        assert!(dao.get_run("old").await.unwrap().is_none());
        assert!(dao.get_run("open").await.unwrap().is_some());

        assert_eq!(daemon.purge_once(Utc::now()).await.unwrap(), 0);
    }
}
