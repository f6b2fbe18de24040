//! # ファイルストレージ
//!
//! `BlobStorage` ポートの実装。
//! - `LocalBlobStorage`: `MEDIA_ROOT` 配下のローカルディスク
//! - `S3BlobStorage`: S3互換ストレージ（`vendor-aws` feature）

#[cfg(feature = "vendor-aws")]
pub mod s3;

#[cfg(feature = "vendor-aws")]
pub use s3::S3BlobStorage;

use std::path::{Component, Path, PathBuf};

use qrsign_core::{BlobStorage, StorageError};

/// ストレージキーを検証する。相対パスで、`..` やルートを含まないこと。
pub fn validate_key(key: &str) -> Result<&str, StorageError> {
    let path = Path::new(key);
    let plain = !key.is_empty()
        && !key.contains('\\')
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(key)
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// ローカルディスクのファイルストレージ。Blob参照はルートからの相対キー。
pub struct LocalBlobStorage {
    root: PathBuf,
}

impl LocalBlobStorage {
    /// ルートディレクトリから構築する。
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(validate_key(key)?))
    }
}

#[async_trait::async_trait]
impl BlobStorage for LocalBlobStorage {
    async fn write_file(&self, key: &str, data: &[u8]) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| StorageError::Unavailable(format!("{}: {e}", path.display())))?;
        tracing::debug!(key = %key, bytes = data.len(), "ファイルを保存");
        Ok(key.to_string())
    }

    async fn read_file(&self, blob_ref: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(blob_ref)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(blob_ref.to_string()),
            _ => StorageError::Unavailable(format!("{}: {e}", path.display())),
        })
    }
}
