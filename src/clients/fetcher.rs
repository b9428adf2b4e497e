use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{Client, header::CONTENT_TYPE};
use tokio::time::Instant;
use tracing::debug;

/// 転送中の進捗通知の最小間隔。
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// プロバイダが返したURLからダウンロードした生成物。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAsset {
    pub body: Bytes,
    pub content_type: Option<String>,
}

/// 受信済みのバイト数を受け取る進捗通知。
pub type Progress<'a> = &'a (dyn Fn(usize) + Send + Sync);

#[async_trait]
pub trait OutputFetcher: Send + Sync {
    /// `url` をダウンロードする。2xx 以外はエラー。
    ///
    /// 本文の受信中は `progress` を定期的に呼ぶ。
    async fn fetch(&self, url: &str, progress: Progress<'_>) -> Result<FetchedAsset>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build asset download client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OutputFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, progress: Progress<'_>) -> Result<FetchedAsset> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("download request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("download from {url} returned an error status"))?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        progress(0);

        let mut body = BytesMut::new();
        let mut reported = Instant::now();
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("failed to read body from {url}"))?
        {
            body.extend_from_slice(&chunk);
            if reported.elapsed() >= PROGRESS_INTERVAL {
                progress(body.len());
                reported = Instant::now();
            }
        }
        let body = body.freeze();

        debug!(url, size = body.len(), content_type = ?content_type, "provider output downloaded");
        Ok(FetchedAsset { body, content_type })
    }
}
