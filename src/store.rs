pub mod dao;
pub mod models;

use thiserror::Error;
use uuid::Uuid;

use self::models::{JobKind, JobStatus};

/// Job Record の状態遷移が拒否されたことを表すエラー。
///
/// DAO 実装は `anyhow::Error` に包んで返し、呼び出し側はダウンキャストで判別する。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordStateError {
    #[error("{kind} job {id} not found")]
    NotFound { kind: JobKind, id: Uuid },
    #[error("{kind} job {id} is already {status}")]
    Terminal {
        kind: JobKind,
        id: Uuid,
        status: JobStatus,
    },
}
