//! # 永続化ポート
//!
//! コアが依存するリポジトリとBlobストレージの抽象インターフェース。
//! 実装はゲートウェイ側（ローカルディスク・S3）と `memory` モジュール（テスト用）にある。

use qrsign_types::{Document, Package, Signature};

use crate::error::{RepositoryError, StorageError};

/// ドキュメント・パッケージ・署名のリポジトリ。
///
/// ## 単一書き込み者の契約
/// `save_document` と `save_package` は `version` による比較交換で保存しなければならない。
/// 保存済みのバージョンと一致しない場合は `RepositoryError::Conflict` を返す。
/// これにより、同じドキュメントに2つのセッションが同時に確保されることはなく、
/// パッケージへのメンバー追加が同時に起きても片方が失われることはない。
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    /// ドキュメントを取得する。
    async fn load_document(&self, id: &str) -> Result<Document, RepositoryError>;

    /// ドキュメントを保存し、バージョンを進めた保存後の値を返す。
    ///
    /// `version == 0` は新規作成を意味する。
    async fn save_document(&self, document: &Document) -> Result<Document, RepositoryError>;

    /// 所有者のドキュメントを作成日時順に列挙する。
    async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>, RepositoryError>;

    /// パッケージを取得する。
    async fn load_package(&self, id: &str) -> Result<Package, RepositoryError>;

    /// パッケージを保存し、バージョンを進めた保存後の値を返す。
    ///
    /// `version == 0` は新規作成を意味する。
    async fn save_package(&self, package: &Package) -> Result<Package, RepositoryError>;

    /// 所有者のパッケージを作成日時順に列挙する。
    async fn list_packages(&self, owner_id: &str) -> Result<Vec<Package>, RepositoryError>;

    /// 署名を保存する。同じドキュメントの署名が既にある場合は `Conflict`。
    async fn save_signature(&self, signature: &Signature) -> Result<(), RepositoryError>;

    /// ドキュメントの署名を取得する。
    async fn signature_for_document(
        &self,
        document_id: &str,
    ) -> Result<Option<Signature>, RepositoryError>;
}

/// Blobストレージ。バックエンド（ローカルディスク・オブジェクトストレージ）はコアから不透明。
#[async_trait::async_trait]
pub trait BlobStorage: Send + Sync {
    /// `key` にデータを書き込み、読み出し用の参照を返す。
    async fn write_file(&self, key: &str, data: &[u8]) -> Result<String, StorageError>;

    /// 参照からデータを読み出す。
    async fn read_file(&self, blob_ref: &str) -> Result<Vec<u8>, StorageError>;
}
