//! # S3互換ファイルストレージ
//!
//! AWS S3, MinIO, Cloudflare R2 等に原本と署名を保存する。
//! Blob参照はオブジェクトキーそのもの。

use qrsign_core::{BlobStorage, StorageError};

use super::validate_key;

/// S3互換ストレージによる `BlobStorage` 実装。
pub struct S3BlobStorage {
    bucket: s3::Bucket,
}

impl S3BlobStorage {
    /// バケットから構築する。
    pub fn new(bucket: s3::Bucket) -> Self {
        Self { bucket }
    }

    /// 環境変数から構築する。
    ///
    /// `S3_REGION` が未設定なら、AWSのエンドポイント（`s3.REGION.amazonaws.com`）から
    /// リージョンを読み取り、それ以外は `us-east-1` とする。
    pub fn from_env() -> anyhow::Result<Self> {
        let endpoint =
            std::env::var("S3_ENDPOINT").unwrap_or_else(|_| "http://localhost:9000".to_string());
        let access_key =
            std::env::var("S3_ACCESS_KEY").unwrap_or_else(|_| "minioadmin".to_string());
        let secret_key =
            std::env::var("S3_SECRET_KEY").unwrap_or_else(|_| "minioadmin".to_string());
        let bucket_name =
            std::env::var("S3_BUCKET").unwrap_or_else(|_| "qrsign-documents".to_string());

        let region_name = std::env::var("S3_REGION").ok().unwrap_or_else(|| {
            endpoint
                .find("s3.")
                .and_then(|start| {
                    let rest = &endpoint[start + 3..];
                    rest.find(".amazonaws.com").map(|end| rest[..end].to_string())
                })
                .unwrap_or_else(|| "us-east-1".to_string())
        });
        let region = s3::Region::Custom {
            region: region_name,
            endpoint: endpoint.clone(),
        };
        let credentials =
            s3::creds::Credentials::new(Some(&access_key), Some(&secret_key), None, None, None)?;
        let bucket = s3::Bucket::new(&bucket_name, region, credentials)?.with_path_style();

        tracing::info!(s3_endpoint = %endpoint, bucket = %bucket_name, "S3ストレージを設定");
        Ok(Self::new(*bucket))
    }
}

#[async_trait::async_trait]
impl BlobStorage for S3BlobStorage {
    async fn write_file(&self, key: &str, data: &[u8]) -> Result<String, StorageError> {
        let key = validate_key(key)?;
        let response = self
            .bucket
            .put_object(key, data)
            .await
            .map_err(|e| StorageError::Unavailable(format!("アップロード失敗 {key}: {e}")))?;
        let status = response.status_code();
        if !(200..300).contains(&status) {
            return Err(StorageError::Unavailable(format!(
                "アップロード失敗 {key}: HTTP {status}"
            )));
        }
        Ok(key.to_string())
    }

    async fn read_file(&self, blob_ref: &str) -> Result<Vec<u8>, StorageError> {
        let key = validate_key(blob_ref)?;
        let response = self
            .bucket
            .get_object(key)
            .await
            .map_err(|e| StorageError::Unavailable(format!("取得失敗 {key}: {e}")))?;
        match response.status_code() {
            200..=299 => Ok(response.bytes().to_vec()),
            404 => Err(StorageError::NotFound(key.to_string())),
            status => Err(StorageError::Unavailable(format!(
                "取得失敗 {key}: HTTP {status}"
            ))),
        }
    }
}
