pub mod keys;
pub mod s3;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub use self::s3::S3AssetStore;

/// 生成物を保存するオブジェクトストレージ。
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// `key` にアップロードし、保存したキーを返す。
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<String>;

    /// 公開URLを返す。公開ベースURLが未設定なら `None`。
    fn public_url(&self, key: &str) -> Option<String>;

    /// キーを削除する。存在しないキーの削除も成功扱い。
    async fn delete(&self, key: &str) -> Result<()>;

    fn bucket(&self) -> &str;
}
