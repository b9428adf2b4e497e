use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    config::{Credentials, Region},
    primitives::ByteStream,
};
use bytes::Bytes;
use tracing::{debug, error, info};

use super::{AssetStore, keys};
use crate::config::Config;

/// S3 互換ストレージ（MinIO を含む）への保存。
pub struct S3AssetStore {
    client: Client,
    bucket: String,
    public_base: Option<String>,
}

impl S3AssetStore {
    /// 設定からクライアントを構築する。
    ///
    /// エンドポイントが指定されている場合は path-style アドレッシングを使う。
    pub async fn from_config(config: &Config) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.s3_region().to_string()));
        if let (Some(access_key), Some(secret_key)) =
            (config.s3_access_key(), config.s3_secret_key())
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "comic-worker-static",
            ));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = config.s3_endpoint_url() {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        info!(
            bucket = config.s3_bucket_name(),
            endpoint = config.s3_endpoint_url().unwrap_or("aws"),
            "S3 asset store initialized"
        );

        Ok(Self {
            client,
            bucket: config.s3_bucket_name().to_string(),
            public_base: config.s3_public_url().map(str::to_string),
        })
    }
}

#[async_trait]
impl AssetStore for S3AssetStore {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<String> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                if let Some(service_error) = e.as_service_error() {
                    error!(key, ?service_error, "S3 put_object rejected");
                }
                anyhow!("failed to upload {key} to S3: {e}")
            })?;
        debug!(key, size, content_type, "asset uploaded");
        Ok(key.to_string())
    }

    fn public_url(&self, key: &str) -> Option<String> {
        self.public_base
            .as_deref()
            .map(|base| keys::public_url(base, &self.bucket, key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        // S3 の DeleteObject は存在しないキーでも成功する。
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("failed to delete {key} from S3: {e}"))
            .context("asset delete failed")?;
        debug!(key, "asset deleted");
        Ok(())
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}
