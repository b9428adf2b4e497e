use std::{sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::provider::{PollOutcome, ProviderAdapter, ProviderError, StageParams};
use crate::{
    store::models::JobKind,
    util::{
        error::{ErrorKind, classify_error},
        retry::RetryConfig,
        text::truncate_error_message,
    },
};

const AVATAR_PROMPT: &str = "Turn the person in this photo into a clean comic-book style \
     character portrait. Keep the face recognizable, bold ink outlines, flat cel shading, \
     plain light background.";
const DEFAULT_MOTION_PROMPT: &str =
    "The character looks around and breathes naturally; gentle camera push-in, comic style.";

fn scene_prompt(theme: &str) -> String {
    format!(
        "Place this comic character in a {theme} setting as a single wide comic panel. \
         Preserve the character's look; dramatic lighting, detailed background."
    )
}

/// Replicate の prediction 状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl Prediction {
    fn error_text(&self) -> String {
        match &self.error {
            Some(Value::String(message)) if !message.is_empty() => message.clone(),
            Some(Value::Null) | None => format!("prediction {} ended without detail", self.id),
            Some(other) => other.to_string(),
        }
    }

    fn into_outcome(self) -> PollOutcome {
        match self.status {
            PredictionStatus::Starting | PredictionStatus::Processing => PollOutcome::Pending,
            PredictionStatus::Succeeded => PollOutcome::Succeeded(self.output.unwrap_or(Value::Null)),
            PredictionStatus::Failed => PollOutcome::Failed(self.error_text()),
            PredictionStatus::Canceled => PollOutcome::Canceled(self.error_text()),
            PredictionStatus::Unknown => {
                warn!(prediction_id = %self.id, "unknown prediction status, treating as pending");
                PollOutcome::Pending
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct CreatePredictionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
    input: &'a Value,
}

/// Replicate HTTP API クライアント。
#[derive(Debug, Clone)]
pub struct ReplicateClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
    retry: RetryConfig,
}

impl ReplicateClient {
    /// # Errors
    /// ベースURLが不正、または HTTP クライアントの構築に失敗した場合はエラーを返す。
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
        max_retries: usize,
        backoff_base_ms: u64,
        backoff_cap_ms: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build replicate client")?;
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("invalid replicate base URL")?;
        if token.is_none() {
            warn!("REPLICATE_API_TOKEN is not set; generation requests will be rejected");
        }
        Ok(Self {
            client,
            base_url,
            token,
            retry: RetryConfig::new(max_retries.max(1), backoff_base_ms, backoff_cap_ms),
        })
    }

    fn token(&self) -> Result<&str, ProviderError> {
        self.token
            .as_deref()
            .ok_or_else(|| ProviderError::Rejected("replicate API token is not configured".into()))
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|e| ProviderError::Transport(anyhow!("invalid replicate URL {path}: {e}")))
    }

    /// prediction を作成する。
    ///
    /// `owner/name:version` 形式ならバージョン指定で、それ以外はモデルの公式エンドポイントに投げる。
    /// 作成は冪等ではないため再試行しない。
    ///
    /// # Errors
    /// 4xx は [`ProviderError::Rejected`]、通信失敗や 5xx は [`ProviderError::Transport`]。
    pub async fn create_prediction(
        &self,
        model: &str,
        input: &Value,
    ) -> Result<Prediction, ProviderError> {
        let token = self.token()?;
        let (url, body) = match model.split_once(':') {
            Some((_, version)) => (
                self.endpoint("v1/predictions")?,
                CreatePredictionRequest {
                    version: Some(version),
                    input,
                },
            ),
            None => (
                self.endpoint(&format!("v1/models/{model}/predictions"))?,
                CreatePredictionRequest {
                    version: None,
                    input,
                },
            ),
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(anyhow::Error::new(e)))?;

        let status = response.status();
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected(format!(
                "{status}: {}",
                truncate_error_message(&detail)
            )));
        }
        let response = response
            .error_for_status()
            .map_err(|e| ProviderError::Transport(anyhow::Error::new(e)))?;

        let prediction: Prediction = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        debug!(model, prediction_id = %prediction.id, status = ?prediction.status, "prediction created");
        Ok(prediction)
    }

    /// prediction の状態を取得する。一時的な失敗は再試行する。
    ///
    /// # Errors
    /// 再試行が尽きた通信失敗、または応答のデコード失敗。
    pub async fn get_prediction(&self, id: &str) -> Result<Prediction, ProviderError> {
        let token = self.token()?;
        let url = self.endpoint(&format!("v1/predictions/{id}"))?;

        let response = self
            .retry
            .run(
                "replicate.get_prediction",
                |error: &anyhow::Error| {
                    matches!(classify_error(error, ErrorKind::Retryable), ErrorKind::Retryable)
                },
                || {
                    let request = self.client.get(url.clone()).bearer_auth(token);
                    async move {
                        request
                            .send()
                            .await
                            .and_then(reqwest::Response::error_for_status)
                            .map_err(anyhow::Error::new)
                    }
                },
            )
            .await
            .map_err(ProviderError::Transport)?;

        response
            .json::<Prediction>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

/// 1ステージ分の Replicate モデル呼び出し。
pub struct ReplicateAdapter {
    client: Arc<ReplicateClient>,
    kind: JobKind,
    model: String,
    openai_api_key: Option<String>,
    name: String,
}

impl ReplicateAdapter {
    #[must_use]
    pub fn new(
        client: Arc<ReplicateClient>,
        kind: JobKind,
        model: impl Into<String>,
        openai_api_key: Option<String>,
    ) -> Self {
        let model = model.into();
        Self {
            client,
            kind,
            name: format!("replicate:{model}"),
            model,
            openai_api_key,
        }
    }

    fn build_input(&self, params: &StageParams) -> Result<Value, ProviderError> {
        if params.kind() != self.kind {
            return Err(ProviderError::Rejected(format!(
                "{} adapter received {} parameters",
                self.kind,
                params.kind()
            )));
        }

        let mut input = match params {
            StageParams::Avatar { image_url } => json!({
                "input_images": [image_url],
                "prompt": AVATAR_PROMPT,
                "aspect_ratio": "1:1",
                "output_format": "png",
                "number_of_images": 1,
            }),
            StageParams::Scene { avatar_url, theme } => json!({
                "input_images": [avatar_url],
                "prompt": scene_prompt(theme),
                "aspect_ratio": "3:2",
                "output_format": "png",
                "number_of_images": 1,
            }),
            StageParams::Animation {
                scene_url,
                duration_seconds,
                prompt,
            } => json!({
                "first_frame_image": scene_url,
                "prompt": prompt.as_deref().unwrap_or(DEFAULT_MOTION_PROMPT),
                "prompt_optimizer": true,
                "duration": duration_seconds,
            }),
        };

        if let (Some(key), JobKind::Avatar | JobKind::Scene) = (&self.openai_api_key, self.kind) {
            if let Some(map) = input.as_object_mut() {
                map.insert("openai_api_key".into(), Value::String(key.clone()));
            }
        }
        Ok(input)
    }
}

#[async_trait]
impl ProviderAdapter for ReplicateAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, params: &StageParams) -> Result<String, ProviderError> {
        let input = self.build_input(params)?;
        let prediction = self.client.create_prediction(&self.model, &input).await?;
        match prediction.status {
            PredictionStatus::Failed | PredictionStatus::Canceled => {
                Err(ProviderError::Rejected(prediction.error_text()))
            }
            _ => Ok(prediction.id),
        }
    }

    async fn poll(&self, handle: &str) -> Result<PollOutcome, ProviderError> {
        Ok(self.client.get_prediction(handle).await?.into_outcome())
    }
}
