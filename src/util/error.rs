/// エラー分類とリトライ判定ユーティリティ。
use anyhow::Error;
use reqwest::StatusCode;
use sqlx::Error as SqlxError;

use crate::store::RecordStateError;

/// エラーの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    /// リトライ可能なエラー（一時的なネットワークエラー、タイムアウトなど）
    Retryable,
    /// リトライ不可能なエラー（状態遷移の競合、バリデーションエラーなど）
    NonRetryable,
    /// 致命的なエラー（認証エラー、設定エラーなど）
    Fatal,
}

/// 外部呼び出しで発生したエラーを分類する。
///
/// 既知の型に当てはまらないエラーは `fallback` を返す。
#[must_use]
pub(crate) fn classify_error(error: &Error, fallback: ErrorKind) -> ErrorKind {
    if let Some(state_err) = error.downcast_ref::<RecordStateError>() {
        return match state_err {
            RecordStateError::NotFound { .. } | RecordStateError::Terminal { .. } => {
                ErrorKind::NonRetryable
            }
        };
    }

    if let Some(reqwest_err) = error.downcast_ref::<reqwest::Error>() {
        if reqwest_err.is_timeout() || reqwest_err.is_connect() {
            return ErrorKind::Retryable;
        }

        if let Some(status) = reqwest_err.status() {
            match status {
                StatusCode::INTERNAL_SERVER_ERROR
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
                | StatusCode::TOO_MANY_REQUESTS => return ErrorKind::Retryable,
                StatusCode::BAD_REQUEST
                | StatusCode::NOT_FOUND
                | StatusCode::GONE
                | StatusCode::UNPROCESSABLE_ENTITY => return ErrorKind::NonRetryable,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return ErrorKind::Fatal,
                _ => {}
            }
        }
    }

    if let Some(sqlx_err) = error.downcast_ref::<SqlxError>() {
        match sqlx_err {
            SqlxError::PoolTimedOut
            | SqlxError::PoolClosed
            | SqlxError::Io(_)
            | SqlxError::Database(_) => return ErrorKind::Retryable,
            SqlxError::RowNotFound => return ErrorKind::NonRetryable,
            SqlxError::Configuration(_) => return ErrorKind::Fatal,
            _ => {}
        }
    }

    fallback
}

/// ブックキーピング（Job Record 更新）エラーがリトライ可能かどうか。
///
/// 状態遷移の競合と致命的エラー以外はリトライする。
#[must_use]
pub(crate) fn is_retryable_bookkeeping(error: &Error) -> bool {
    matches!(
        classify_error(error, ErrorKind::Retryable),
        ErrorKind::Retryable
    )
}

/// 転送（ダウンロード・アップロード）エラーがリトライ可能かどうか。
#[must_use]
pub(crate) fn is_retryable_transfer(error: &Error) -> bool {
    matches!(
        classify_error(error, ErrorKind::Retryable),
        ErrorKind::Retryable
    )
}
