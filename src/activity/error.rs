use std::time::Duration;

use thiserror::Error;

use crate::{
    clients::ProviderError,
    store::models::JobKind,
    util::error::{ErrorKind, classify_error, is_retryable_bookkeeping, is_retryable_transfer},
};

/// アクティビティの失敗。リトライ可否は [`ActivityError::is_retryable`] で決まる。
#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("bookkeeping failed: {0:#}")]
    Bookkeeping(#[source] anyhow::Error),
    #[error("provider submission failed: {0}")]
    Submission(String),
    #[error("provider poll failed: {0:#}")]
    ProviderPoll(#[source] anyhow::Error),
    #[error("generation failed: {0}")]
    ProviderFailed(String),
    #[error("{stage} generation timed out after {}s", .ceiling.as_secs())]
    PollTimeout { stage: JobKind, ceiling: Duration },
    #[error("provider returned invalid output: {0}")]
    InvalidOutput(String),
    #[error("asset download failed: {0:#}")]
    Transfer(#[source] anyhow::Error),
    #[error("asset storage failed: {0:#}")]
    Storage(#[source] anyhow::Error),
    #[error("no heartbeat within {}s", .0.as_secs())]
    HeartbeatTimeout(Duration),
    #[error("exceeded start-to-close timeout of {}s", .0.as_secs())]
    StartToCloseTimeout(Duration),
}

impl ActivityError {
    pub(crate) fn bookkeeping(error: anyhow::Error) -> Self {
        Self::Bookkeeping(error)
    }

    /// 生成リクエストは冪等ではないため、送信時の失敗はすべて再試行しない。
    pub(crate) fn from_submission(error: ProviderError) -> Self {
        match error {
            ProviderError::Rejected(message) | ProviderError::Decode(message) => {
                Self::Submission(message)
            }
            ProviderError::Transport(source) => Self::Submission(format!("{source:#}")),
        }
    }

    pub(crate) fn from_poll(error: ProviderError) -> Self {
        match error {
            ProviderError::Rejected(message) => Self::ProviderFailed(message),
            ProviderError::Transport(source) => Self::ProviderPoll(source),
            ProviderError::Decode(message) => Self::InvalidOutput(message),
        }
    }

    /// プロバイダへの再送信を伴わない失敗だけをリトライ対象にする。
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Bookkeeping(source) => is_retryable_bookkeeping(source),
            Self::ProviderPoll(source) => matches!(
                classify_error(source, ErrorKind::Retryable),
                ErrorKind::Retryable
            ),
            Self::Transfer(source) => is_retryable_transfer(source),
            Self::Storage(source) => !matches!(
                classify_error(source, ErrorKind::Retryable),
                ErrorKind::Fatal
            ),
            Self::HeartbeatTimeout(_) | Self::StartToCloseTimeout(_) => true,
            Self::Validation(_)
            | Self::Submission(_)
            | Self::ProviderFailed(_)
            | Self::PollTimeout { .. }
            | Self::InvalidOutput(_) => false,
        }
    }

    /// ログとメトリクスで原因を区別するための分類名。
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Bookkeeping(_) => "bookkeeping",
            Self::Submission(_) => "provider_submission",
            Self::ProviderPoll(_) | Self::ProviderFailed(_) | Self::InvalidOutput(_) => {
                "provider_processing"
            }
            Self::PollTimeout { .. } => "provider_timeout",
            Self::Transfer(_) => "transfer",
            Self::Storage(_) => "storage",
            Self::HeartbeatTimeout(_) | Self::StartToCloseTimeout(_) => "liveness",
        }
    }
}
