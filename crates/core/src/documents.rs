//! # ドキュメント・パッケージのユースケース
//!
//! アップロード、パッケージ管理、一覧・状態取得、ダウンロード。
//! 状態遷移を伴う署名処理は `orchestrator` が担い、ここではドキュメントの状態を変えない。

use std::sync::Arc;

use qrsign_types::{unix_now, Document, DocumentStatus, Package, PackageStatus, Signature};
use serde::Serialize;

use crate::archive::{PackageArchiveBuilder, SIGNATURE_SUFFIX};
use crate::error::{RepositoryError, SigningError};
use crate::orchestrator::{ensure_owner, load_members, PackageReport};
use crate::ports::{BlobStorage, Repository};

/// アップロードサイズの既定上限（50 MiB）。
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 50 * 1024 * 1024;

/// パッケージ更新が競合したときの再試行回数。
const PACKAGE_UPDATE_ATTEMPTS: usize = 8;

/// 受け付ける拡張子とMIMEタイプ。
const ALLOWED_TYPES: &[(&str, &str)] = &[
    ("pdf", "application/pdf"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
];

/// アップロード要求。
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// 所有者ID
    pub owner_id: String,
    /// 元のファイル名
    pub filename: String,
    /// タイトル（空ならファイル名）
    pub title: String,
    /// クライアントが申告したMIMEタイプ（なければ拡張子から決める）
    pub mime_type: Option<String>,
    /// ファイル本体
    pub data: Vec<u8>,
    /// 追加先のパッケージ
    pub package_id: Option<String>,
}

/// ドキュメントと、署名済みならその署名。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentView {
    /// ドキュメント
    #[serde(flatten)]
    pub document: Document,
    /// 署名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

/// パッケージ一覧の1行。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageSummary {
    /// パッケージID
    pub id: String,
    /// タイトル
    pub title: String,
    /// 説明
    pub description: String,
    /// 導出された集約状態
    pub status: PackageStatus,
    /// メンバー数
    pub document_count: usize,
    /// 作成日時（UNIX秒）
    pub created_at: u64,
}

/// 拡張子とMIMEタイプを検証し、保存するMIMEタイプを返す。
fn resolve_mime_type(filename: &str, declared: Option<&str>) -> Result<String, SigningError> {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let Some((_, mime)) = ALLOWED_TYPES.iter().find(|(ext, _)| *ext == extension) else {
        return Err(SigningError::InvalidDocument(format!(
            "対応していないファイル形式です: {filename}（pdf, png, jpg, jpeg のみ）"
        )));
    };

    match declared {
        Some(declared) if !declared.is_empty() && !declared.eq_ignore_ascii_case(mime) => {
            Err(SigningError::InvalidDocument(format!(
                "MIMEタイプ {declared} は拡張子 .{extension} と一致しません"
            )))
        }
        _ => Ok(mime.to_string()),
    }
}

/// ドキュメント・パッケージのユースケース。
pub struct DocumentService {
    repo: Arc<dyn Repository>,
    storage: Arc<dyn BlobStorage>,
    archive: PackageArchiveBuilder,
    max_upload_size: u64,
}

impl DocumentService {
    /// ポートとアップロード上限から構築する。
    pub fn new(
        repo: Arc<dyn Repository>,
        storage: Arc<dyn BlobStorage>,
        max_upload_size: u64,
    ) -> Self {
        Self {
            archive: PackageArchiveBuilder::new(repo.clone(), storage.clone()),
            repo,
            storage,
            max_upload_size,
        }
    }

    /// アップロード上限（バイト）。
    pub fn max_upload_size(&self) -> u64 {
        self.max_upload_size
    }

    /// ドキュメントをアップロードする。
    ///
    /// 本体は `documents/{id}/{filename}` に保存し、`Uploaded` のドキュメントを作る。
    pub async fn upload_document(&self, request: UploadRequest) -> Result<Document, SigningError> {
        if request.data.is_empty() {
            return Err(SigningError::InvalidDocument("ファイルが空です".to_string()));
        }
        if request.data.len() as u64 > self.max_upload_size {
            return Err(SigningError::InvalidDocument(format!(
                "ファイルサイズ {} バイトは上限 {} バイトを超えています",
                request.data.len(),
                self.max_upload_size
            )));
        }
        let filename = request.filename.trim();
        if filename.is_empty() || filename.contains(['/', '\\']) {
            return Err(SigningError::InvalidDocument(format!(
                "不正なファイル名です: {:?}",
                request.filename
            )));
        }
        let mime_type = resolve_mime_type(filename, request.mime_type.as_deref())?;

        if let Some(package_id) = &request.package_id {
            let package = self.repo.load_package(package_id).await?;
            ensure_owner(&package.owner_id, &request.owner_id, package_id)?;
        }

        let id = uuid::Uuid::new_v4().to_string();
        let blob_ref = self
            .storage
            .write_file(&format!("documents/{id}/{filename}"), &request.data)
            .await?;

        let now = unix_now();
        let title = match request.title.trim() {
            "" => filename.to_string(),
            title => title.to_string(),
        };
        let document = Document {
            id: id.clone(),
            title,
            filename: filename.to_string(),
            mime_type,
            file_size: request.data.len() as u64,
            owner_id: request.owner_id.clone(),
            blob_ref,
            digest: qrsign_crypto::content_digest(&request.data),
            status: DocumentStatus::Uploaded,
            signature_id: None,
            active_session: None,
            failure_reason: None,
            session_started_at: None,
            package_id: request.package_id.clone(),
            authority_document_id: None,
            signed_copy_ref: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        let saved = self.repo.save_document(&document).await?;

        if let Some(package_id) = &request.package_id {
            self.append_member(package_id, &saved.id).await?;
        }

        tracing::info!(
            document_id = %saved.id,
            owner_id = %saved.owner_id,
            size = saved.file_size,
            digest = %saved.digest,
            "ドキュメントをアップロード"
        );
        Ok(saved)
    }

    /// 空のパッケージを作る。
    pub async fn create_package(
        &self,
        owner_id: &str,
        title: &str,
        description: &str,
    ) -> Result<Package, SigningError> {
        if title.trim().is_empty() {
            return Err(SigningError::InvalidDocument(
                "パッケージのタイトルが空です".to_string(),
            ));
        }
        let now = unix_now();
        let package = Package {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.trim().to_string(),
            description: description.to_string(),
            owner_id: owner_id.to_string(),
            document_ids: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        };
        let saved = self.repo.save_package(&package).await?;
        tracing::info!(package_id = %saved.id, owner_id = %owner_id, "パッケージを作成");
        Ok(saved)
    }

    /// ドキュメントをパッケージの末尾に追加する。既に含まれていれば何もしない。
    ///
    /// 別のパッケージに属するドキュメントと、署名中のドキュメントは追加できない。
    pub async fn add_document_to_package(
        &self,
        package_id: &str,
        document_id: &str,
        owner_id: &str,
    ) -> Result<Package, SigningError> {
        let package = self.repo.load_package(package_id).await?;
        ensure_owner(&package.owner_id, owner_id, package_id)?;
        let mut document = self.repo.load_document(document_id).await?;
        ensure_owner(&document.owner_id, owner_id, document_id)?;
        if document.status == DocumentStatus::Signing {
            return Err(SigningError::InvalidState(format!(
                "document {document_id} は署名中です"
            )));
        }

        match document.package_id.as_deref() {
            Some(current) if current != package_id => {
                return Err(SigningError::InvalidState(format!(
                    "document {document_id} は package {current} に属しています"
                )))
            }
            Some(_) => {}
            None => {
                document.package_id = Some(package_id.to_string());
                document.updated_at = unix_now();
                self.repo.save_document(&document).await?;
            }
        }

        self.append_member(package_id, document_id).await
    }

    /// メンバーを末尾に追加する。比較交換に負けた場合は読み直して再試行する。
    async fn append_member(
        &self,
        package_id: &str,
        document_id: &str,
    ) -> Result<Package, SigningError> {
        for _ in 0..PACKAGE_UPDATE_ATTEMPTS {
            let mut package = self.repo.load_package(package_id).await?;
            if !package.add_document(document_id) {
                return Ok(package);
            }
            match self.repo.save_package(&package).await {
                Ok(saved) => {
                    tracing::info!(
                        package_id = %package_id,
                        document_id = %document_id,
                        members = saved.document_ids.len(),
                        "パッケージにドキュメントを追加"
                    );
                    return Ok(saved);
                }
                Err(RepositoryError::Conflict(_)) => tokio::task::yield_now().await,
                Err(e) => return Err(e.into()),
            }
        }
        Err(SigningError::InvalidState(format!(
            "package {package_id} の更新が競合し続けています"
        )))
    }

    /// 所有者のドキュメント一覧。
    pub async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>, SigningError> {
        Ok(self.repo.list_documents(owner_id).await?)
    }

    /// 所有者のパッケージ一覧。状態はメンバーから毎回導出する。
    pub async fn list_packages(&self, owner_id: &str) -> Result<Vec<PackageSummary>, SigningError> {
        let packages = self.repo.list_packages(owner_id).await?;
        let mut summaries = Vec::with_capacity(packages.len());
        for package in packages {
            let statuses: Vec<DocumentStatus> = load_members(self.repo.as_ref(), &package)
                .await?
                .iter()
                .map(|d| d.status)
                .collect();
            summaries.push(PackageSummary {
                status: PackageStatus::derive(&statuses),
                document_count: package.document_ids.len(),
                id: package.id,
                title: package.title,
                description: package.description,
                created_at: package.created_at,
            });
        }
        Ok(summaries)
    }

    /// ドキュメントの状態と署名。
    pub async fn document_status(
        &self,
        document_id: &str,
        owner_id: &str,
    ) -> Result<DocumentView, SigningError> {
        let document = self.repo.load_document(document_id).await?;
        ensure_owner(&document.owner_id, owner_id, document_id)?;
        let signature = self.repo.signature_for_document(document_id).await?;
        Ok(DocumentView {
            document,
            signature,
        })
    }

    /// パッケージの状態とメンバーの状態。
    pub async fn package_status(
        &self,
        package_id: &str,
        owner_id: &str,
    ) -> Result<PackageReport, SigningError> {
        let package = self.repo.load_package(package_id).await?;
        ensure_owner(&package.owner_id, owner_id, package_id)?;
        let documents = load_members(self.repo.as_ref(), &package).await?;
        Ok(PackageReport::build(package, &documents, &[]))
    }

    /// 原本を返す: `(本体, ファイル名, MIMEタイプ)`。
    pub async fn download_document(
        &self,
        document_id: &str,
        owner_id: &str,
    ) -> Result<(Vec<u8>, String, String), SigningError> {
        let document = self.repo.load_document(document_id).await?;
        ensure_owner(&document.owner_id, owner_id, document_id)?;
        let data = self.storage.read_file(&document.blob_ref).await?;
        Ok((data, document.filename, document.mime_type))
    }

    /// CMS署名を返す: `(DER, "<filename>.cms")`。
    pub async fn download_signature(
        &self,
        document_id: &str,
        owner_id: &str,
    ) -> Result<(Vec<u8>, String), SigningError> {
        let document = self.repo.load_document(document_id).await?;
        ensure_owner(&document.owner_id, owner_id, document_id)?;
        let signature = self
            .repo
            .signature_for_document(document_id)
            .await?
            .ok_or_else(|| SigningError::NotFound(format!("document {document_id} の署名")))?;
        let data = self.storage.read_file(&signature.blob_ref).await?;
        Ok((data, format!("{}{SIGNATURE_SUFFIX}", document.filename)))
    }

    /// 署名機関に登録された署名済みコピーを返す: `(本体, "{stem}-sigex{id}{.ext}", MIMEタイプ)`。
    pub async fn download_signed_copy(
        &self,
        document_id: &str,
        owner_id: &str,
    ) -> Result<(Vec<u8>, String, String), SigningError> {
        let document = self.repo.load_document(document_id).await?;
        ensure_owner(&document.owner_id, owner_id, document_id)?;
        let (Some(authority_document_id), Some(copy_ref)) =
            (&document.authority_document_id, &document.signed_copy_ref)
        else {
            return Err(SigningError::NotFound(format!(
                "document {document_id} の署名済みコピー"
            )));
        };
        let data = self.storage.read_file(copy_ref).await?;
        let filename = document.signed_copy_filename(authority_document_id);
        Ok((data, filename, document.mime_type))
    }

    /// 署名済みメンバーのZIPを返す: `(ZIP, "package_<id>_signed.zip")`。
    pub async fn download_package(
        &self,
        package_id: &str,
        owner_id: &str,
    ) -> Result<(Vec<u8>, String), SigningError> {
        self.archive.build_for_owner(package_id, owner_id).await
    }
}
