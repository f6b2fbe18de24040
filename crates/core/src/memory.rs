//! # インメモリアダプタ
//!
//! `Repository` と `BlobStorage` のプロセス内実装。
//! テストと、外部データベースを持たない単一プロセス構成のゲートウェイで使う。

use std::collections::HashMap;

use qrsign_types::{Document, Package, Signature};
use tokio::sync::RwLock;

use crate::error::{RepositoryError, StorageError};
use crate::ports::{BlobStorage, Repository};

#[derive(Default)]
struct Tables {
    documents: HashMap<String, Document>,
    packages: HashMap<String, Package>,
    /// document_id → Signature
    signatures: HashMap<String, Signature>,
}

/// プロセス内リポジトリ。
///
/// 1つのロックで全テーブルを守るため、比較交換は原子的に行われる。
#[derive(Default)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
}

impl InMemoryRepository {
    /// 空のリポジトリを作る。
    pub fn new() -> Self {
        Self::default()
    }
}

/// 比較交換の判定。`given == 0` は新規作成。
fn check_version(
    kind: &str,
    id: &str,
    stored: Option<u64>,
    given: u64,
) -> Result<(), RepositoryError> {
    match (stored, given) {
        (None, 0) => Ok(()),
        (None, _) => Err(RepositoryError::NotFound(format!("{kind} {id}"))),
        (Some(_), 0) => Err(RepositoryError::Conflict(format!("{kind} {id} は既に存在します"))),
        (Some(stored), given) if stored != given => Err(RepositoryError::Conflict(format!(
            "{kind} {id}: version {given} は古い（現在 {stored}）"
        ))),
        _ => Ok(()),
    }
}

#[async_trait::async_trait]
impl Repository for InMemoryRepository {
    async fn load_document(&self, id: &str) -> Result<Document, RepositoryError> {
        self.tables
            .read()
            .await
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("document {id}")))
    }

    async fn save_document(&self, document: &Document) -> Result<Document, RepositoryError> {
        let mut tables = self.tables.write().await;
        let stored_version = tables.documents.get(&document.id).map(|d| d.version);
        check_version("document", &document.id, stored_version, document.version)?;

        let mut saved = document.clone();
        saved.version = document.version + 1;
        tables.documents.insert(saved.id.clone(), saved.clone());
        Ok(saved)
    }

    async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut documents: Vec<Document> = tables
            .documents
            .values()
            .filter(|d| d.owner_id == owner_id)
            .cloned()
            .collect();
        documents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(documents)
    }

    async fn load_package(&self, id: &str) -> Result<Package, RepositoryError> {
        self.tables
            .read()
            .await
            .packages
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("package {id}")))
    }

    async fn save_package(&self, package: &Package) -> Result<Package, RepositoryError> {
        let mut tables = self.tables.write().await;
        let stored_version = tables.packages.get(&package.id).map(|p| p.version);
        check_version("package", &package.id, stored_version, package.version)?;

        let mut saved = package.clone();
        saved.version = package.version + 1;
        tables.packages.insert(saved.id.clone(), saved.clone());
        Ok(saved)
    }

    async fn list_packages(&self, owner_id: &str) -> Result<Vec<Package>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut packages: Vec<Package> = tables
            .packages
            .values()
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .collect();
        packages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(packages)
    }

    async fn save_signature(&self, signature: &Signature) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables.signatures.contains_key(&signature.document_id) {
            return Err(RepositoryError::Conflict(format!(
                "document {} には既に署名があります",
                signature.document_id
            )));
        }
        tables
            .signatures
            .insert(signature.document_id.clone(), signature.clone());
        Ok(())
    }

    async fn signature_for_document(
        &self,
        document_id: &str,
    ) -> Result<Option<Signature>, RepositoryError> {
        Ok(self.tables.read().await.signatures.get(document_id).cloned())
    }
}

/// プロセス内Blobストレージ。参照はキーそのもの。
#[derive(Default)]
pub struct InMemoryBlobStorage {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStorage {
    /// 空のストレージを作る。
    pub fn new() -> Self {
        Self::default()
    }

    /// 保存済みのBlobを直接書き換える（改ざんの再現用）。
    pub async fn overwrite(&self, blob_ref: &str, data: &[u8]) {
        self.blobs
            .write()
            .await
            .insert(blob_ref.to_string(), data.to_vec());
    }
}

#[async_trait::async_trait]
impl BlobStorage for InMemoryBlobStorage {
    async fn write_file(&self, key: &str, data: &[u8]) -> Result<String, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        self.blobs
            .write()
            .await
            .insert(key.to_string(), data.to_vec());
        Ok(key.to_string())
    }

    async fn read_file(&self, blob_ref: &str) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .read()
            .await
            .get(blob_ref)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(blob_ref.to_string()))
    }
}
