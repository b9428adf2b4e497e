//! Stage-agnostic interface to an asynchronous generative-AI provider.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::store::models::JobKind;

/// Per-stage generation parameters handed to [`ProviderAdapter::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageParams {
    Avatar {
        image_url: String,
    },
    Scene {
        avatar_url: String,
        theme: String,
    },
    Animation {
        scene_url: String,
        duration_seconds: u32,
        prompt: Option<String>,
    },
}

impl StageParams {
    #[must_use]
    pub fn kind(&self) -> JobKind {
        match self {
            StageParams::Avatar { .. } => JobKind::Avatar,
            StageParams::Scene { .. } => JobKind::Scene,
            StageParams::Animation { .. } => JobKind::Animation,
        }
    }
}

/// Result of one status poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Pending,
    Succeeded(Value),
    Failed(String),
    Canceled(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider refused the request outright (bad input, missing credentials, 4xx).
    #[error("provider rejected request: {0}")]
    Rejected(String),
    /// The request did not complete; the provider may or may not have seen it.
    #[error("provider request failed: {0:#}")]
    Transport(#[source] anyhow::Error),
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
}

/// Capability interface, one instance per stage.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Submits a generation request and returns the provider's job handle.
    async fn start(&self, params: &StageParams) -> Result<String, ProviderError>;

    async fn poll(&self, handle: &str) -> Result<PollOutcome, ProviderError>;
}

/// Validates a `succeeded` payload: a non-empty URL string, or an array of URL strings (first
/// one wins).
///
/// # Errors
/// Returns a description of the offending shape.
pub fn output_url(output: &Value) -> Result<String, String> {
    match output {
        Value::String(url) => validate_url(url),
        Value::Array(items) if !items.is_empty() => {
            let urls = items
                .iter()
                .map(|item| match item {
                    Value::String(url) => validate_url(url),
                    other => Err(format!("output array contains non-string element: {other}")),
                })
                .collect::<Result<Vec<_>, _>>()?;
            urls.into_iter()
                .next()
                .ok_or_else(|| "output array is empty".to_string())
        }
        Value::Array(_) => Err("output array is empty".to_string()),
        Value::Null => Err("provider reported success without output".to_string()),
        other => Err(format!("unexpected output shape: {other}")),
    }
}

fn validate_url(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("output URL is empty".to_string());
    }
    match Url::parse(trimmed) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(trimmed.to_string()),
        Ok(url) => Err(format!("output URL has unsupported scheme {}", url.scheme())),
        Err(error) => Err(format!("output is not a URL: {error}")),
    }
}
