//! # 署名オーケストレータ
//!
//! ドキュメント単位の状態機械と、それをメンバーごとに独立に回すパッケージ署名。
//!
//! ```text
//! UPLOADED ──initiate──▶ SIGNING ──complete成功──▶ SIGNED
//!  FAILED  ──initiate──▶ SIGNING ──complete失敗──▶ FAILED
//! ```
//!
//! ## 所有権トークン
//! `initiate` は署名機関を呼ぶ前に、セッションIDを `Document::active_session` に書き込み
//! バージョン比較付きで保存する。保存に負けた側は `SessionAlreadyActive` になる。
//! `complete` はトークンが自分のセッションと一致する場合だけ状態を書き換える。
//! ポーリング中はロックもリポジトリのトランザクションも保持しない。
//!
//! ## 放棄されたセッション
//! 確保から `PollPolicy::session_ttl` を過ぎても完了しないセッションは放棄されたとみなす。
//! 次の `initiate` がドキュメントを `Failed`（理由 `expired`）にしてから確保し直す。
//!
//! ## 署名の確定
//! 署名レコードを保存した後は、ドキュメントを必ず `Signed` にする。
//! 比較交換に負けた場合は読み直して再試行する。


use std::sync::Arc;

use futures::stream::{self, StreamExt};
use qrsign_types::{
    unix_now, Document, DocumentStatus, Package, PackageStatus, Signature, SignerIdentity,
    SigningSession, SubjectKind,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::authority::{
    ExternalSigningClient, SessionRequest, SigningAuthority, SigningPayload,
};
use crate::error::{RepositoryError, SigningError};
use crate::ports::{BlobStorage, Repository};
use crate::OrchestratorConfig;

/// 比較交換に負けたときの再試行回数。
const COMMIT_ATTEMPTS: usize = 8;

/// 放棄されたセッションの失敗理由。
pub const EXPIRED_REASON: &str = "expired";

/// パッケージメンバー1件の署名開始結果。
#[derive(Debug)]
pub enum MemberStart {
    /// セッションを開始した
    Started(SigningSession),
    /// 既に署名済みのため対象外
    AlreadySigned,
    /// 開始に失敗した（他のメンバーには影響しない）
    Failed(SigningError),
}

/// パッケージメンバーの署名開始結果（メンバー順）。
#[derive(Debug)]
pub struct MemberInitiation {
    /// ドキュメントID
    pub document_id: String,
    /// 結果
    pub start: MemberStart,
}

/// パッケージメンバー1件の状態。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberReport {
    /// ドキュメントID
    pub document_id: String,
    /// ドキュメントの状態
    pub status: DocumentStatus,
    /// 署名ID（署名済みの場合）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_id: Option<String>,
    /// 今回の処理で発生したエラー
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// パッケージと、メンバーから導出した集約状態。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageReport {
    /// パッケージ
    pub package: Package,
    /// 導出された集約状態
    pub status: PackageStatus,
    /// メンバー（挿入順）
    pub members: Vec<MemberReport>,
}

impl PackageReport {
    /// メンバーのドキュメントから組み立てる。状態は毎回導出する。
    pub(crate) fn build(
        package: Package,
        documents: &[Document],
        errors: &[(String, SigningError)],
    ) -> Self {
        let statuses: Vec<DocumentStatus> = documents.iter().map(|d| d.status).collect();
        let members = documents
            .iter()
            .map(|d| MemberReport {
                document_id: d.id.clone(),
                status: d.status,
                signature_id: d.signature_id.clone(),
                error: errors
                    .iter()
                    .find(|(id, _)| *id == d.id)
                    .map(|(_, e)| e.to_string()),
            })
            .collect();
        Self {
            package,
            status: PackageStatus::derive(&statuses),
            members,
        }
    }
}

/// 所有者の一致を確認する。
pub(crate) fn ensure_owner(actual: &str, requested: &str, what: &str) -> Result<(), SigningError> {
    if actual != requested {
        return Err(SigningError::AccessDenied(format!("{what} の所有者ではありません")));
    }
    Ok(())
}

/// パッケージのメンバーをメンバー順に読み込む。
pub(crate) async fn load_members(
    repo: &dyn Repository,
    package: &Package,
) -> Result<Vec<Document>, SigningError> {
    let mut documents = Vec::with_capacity(package.document_ids.len());
    for id in &package.document_ids {
        documents.push(repo.load_document(id).await?);
    }
    Ok(documents)
}

/// 署名オーケストレータ。
pub struct SigningOrchestrator {
    repo: Arc<dyn Repository>,
    storage: Arc<dyn BlobStorage>,
    client: ExternalSigningClient,
    package_concurrency: usize,
}

impl SigningOrchestrator {
    /// ポートと署名機関トランスポートから構築する。
    pub fn new(
        repo: Arc<dyn Repository>,
        storage: Arc<dyn BlobStorage>,
        authority: Arc<dyn SigningAuthority>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            repo,
            storage,
            client: ExternalSigningClient::new(authority, config.poll),
            package_concurrency: config.package_concurrency.max(1),
        }
    }

    /// 署名機関クライアント。
    pub fn client(&self) -> &ExternalSigningClient {
        &self.client
    }

    /// ドキュメントの署名を開始する。
    ///
    /// `Uploaded` または `Failed` のドキュメントだけが対象。
    /// 署名中なら `SessionAlreadyActive`、署名済みなら `InvalidState` で、状態は変えない。
    pub async fn initiate_document(
        &self,
        document_id: &str,
        owner_id: &str,
        signer: &SignerIdentity,
    ) -> Result<SigningSession, SigningError> {
        signer.validate()?;
        let document = self.repo.load_document(document_id).await?;
        ensure_owner(&document.owner_id, owner_id, document_id)?;

        let description = format!("Подписание документа: {}", document.title);
        self.start(document, signer, SubjectKind::Document, None, description)
            .await
    }

    /// 署名の完了を待ち、署名を永続化する。
    ///
    /// 失敗した場合はドキュメントを `Failed` にしてからエラーを返す。
    /// 同じセッションで2回呼ぶと2回目は `InvalidState`。
    pub async fn complete_document(
        &self,
        document_id: &str,
        owner_id: &str,
        session: SigningSession,
        cancel: &CancellationToken,
    ) -> Result<Signature, SigningError> {
        let document = self.repo.load_document(document_id).await?;
        ensure_owner(&document.owner_id, owner_id, document_id)?;
        self.finish(document, session, cancel).await
    }

    /// パッケージの全メンバーについて署名を開始する。
    ///
    /// 結果はメンバー順。1件の失敗は他のメンバーの開始を妨げない。
    pub async fn initiate_package(
        &self,
        package_id: &str,
        owner_id: &str,
        signer: &SignerIdentity,
    ) -> Result<Vec<MemberInitiation>, SigningError> {
        signer.validate()?;
        let package = self.repo.load_package(package_id).await?;
        ensure_owner(&package.owner_id, owner_id, package_id)?;
        if package.document_ids.is_empty() {
            return Err(SigningError::InvalidDocument(format!(
                "package {package_id} にドキュメントがありません"
            )));
        }

        let description = format!("Подписание пакета: {}", package.title);
        let initiations: Vec<MemberInitiation> = stream::iter(package.document_ids.iter().cloned())
            .map(|document_id| {
                let description = description.clone();
                async move {
                    let start = self
                        .start_member(&document_id, package_id, owner_id, signer, description)
                        .await;
                    MemberInitiation { document_id, start }
                }
            })
            .buffered(self.package_concurrency)
            .collect()
            .await;

        let started = initiations
            .iter()
            .filter(|m| matches!(m.start, MemberStart::Started(_)))
            .count();
        tracing::info!(
            package_id = %package_id,
            members = initiations.len(),
            started,
            "パッケージの署名を開始"
        );
        Ok(initiations)
    }

    /// パッケージメンバーの署名完了を待ち、集約状態を返す。
    ///
    /// 各メンバーは独立に完了・失敗し、失敗はレポートのデータとして記録される。
    pub async fn complete_package(
        &self,
        package_id: &str,
        owner_id: &str,
        sessions: Vec<SigningSession>,
        cancel: &CancellationToken,
    ) -> Result<PackageReport, SigningError> {
        let package = self
            .check_package_sessions(package_id, owner_id, &sessions)
            .await?;

        let results: Vec<(String, Result<Signature, SigningError>)> = stream::iter(sessions)
            .map(|session| async move {
                let document_id = session.subject_id.clone();
                let result = match self.repo.load_document(&document_id).await {
                    Ok(document) => self.finish(document, session, cancel).await,
                    Err(e) => Err(e.into()),
                };
                (document_id, result)
            })
            .buffered(self.package_concurrency)
            .collect()
            .await;

        let errors: Vec<(String, SigningError)> = results
            .into_iter()
            .filter_map(|(id, r)| r.err().map(|e| (id, e)))
            .collect();

        let documents = load_members(self.repo.as_ref(), &package).await?;
        let report = PackageReport::build(package, &documents, &errors);

        tracing::info!(
            package_id = %package_id,
            status = ?report.status,
            failed = errors.len(),
            "パッケージの署名が終了"
        );
        Ok(report)
    }

    /// セッションがすべてパッケージのメンバーのものか確認する。
    ///
    /// セッションを消費する前に呼べるように `complete_package` から切り出してある。
    pub async fn check_package_sessions(
        &self,
        package_id: &str,
        owner_id: &str,
        sessions: &[SigningSession],
    ) -> Result<Package, SigningError> {
        let package = self.repo.load_package(package_id).await?;
        ensure_owner(&package.owner_id, owner_id, package_id)?;
        if let Some(stray) = sessions
            .iter()
            .find(|s| !package.document_ids.contains(&s.subject_id))
        {
            return Err(SigningError::InvalidState(format!(
                "session {} は package {package_id} のメンバーではありません",
                stray.id
            )));
        }
        Ok(package)
    }

    /// 完了されないまま放棄されたセッションのドキュメントを `Failed` にする。
    ///
    /// ドキュメントが既に別のセッションに移っていれば何もせず `false` を返す。
    pub async fn abandon(&self, session: &SigningSession) -> Result<bool, SigningError> {
        let released = self
            .mark_failed_if_owner(&session.subject_id, &session.id, EXPIRED_REASON)
            .await?;
        if released {
            tracing::warn!(
                document_id = %session.subject_id,
                session_id = %session.id,
                "放棄されたセッションを失効"
            );
        }
        Ok(released)
    }

    async fn start_member(
        &self,
        document_id: &str,
        package_id: &str,
        owner_id: &str,
        signer: &SignerIdentity,
        description: String,
    ) -> MemberStart {
        let document = match self.repo.load_document(document_id).await {
            Ok(document) => document,
            Err(e) => return MemberStart::Failed(e.into()),
        };
        if let Err(e) = ensure_owner(&document.owner_id, owner_id, document_id) {
            return MemberStart::Failed(e);
        }
        if document.status == DocumentStatus::Signed {
            return MemberStart::AlreadySigned;
        }

        match self
            .start(
                document,
                signer,
                SubjectKind::PackageMember,
                Some(package_id),
                description,
            )
            .await
        {
            Ok(session) => MemberStart::Started(session),
            Err(e) => {
                tracing::warn!(
                    package_id = %package_id,
                    document_id = %document_id,
                    error = %e,
                    "メンバーの署名を開始できません"
                );
                MemberStart::Failed(e)
            }
        }
    }

    /// ドキュメントを確保してから署名機関にセッションを開く。
    async fn start(
        &self,
        document: Document,
        signer: &SignerIdentity,
        subject_kind: SubjectKind,
        package_id: Option<&str>,
        description: String,
    ) -> Result<SigningSession, SigningError> {
        let document = self.expire_if_abandoned(document).await?;
        match document.status {
            DocumentStatus::Signing => {
                return Err(SigningError::SessionAlreadyActive(document.id))
            }
            DocumentStatus::Signed => {
                return Err(SigningError::InvalidState(format!(
                    "document {} は署名済みです",
                    document.id
                )))
            }
            DocumentStatus::Uploaded | DocumentStatus::Failed => {}
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let mut claim = document.clone();
        claim.mark_signing(&session_id);
        let claimed = match self.repo.save_document(&claim).await {
            Ok(saved) => saved,
            Err(RepositoryError::Conflict(_)) => {
                return Err(SigningError::SessionAlreadyActive(document.id))
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            document_id = %claimed.id,
            session_id = %session_id,
            "ドキュメントを署名中として確保"
        );

        let request = SessionRequest {
            session_id: session_id.clone(),
            subject_kind,
            document_id: claimed.id.clone(),
            package_id: package_id.map(str::to_string),
            description,
        };
        match self.client.initiate(request, &claimed.digest, signer).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.release(&claimed.id, &session_id, &e).await;
                Err(e)
            }
        }
    }

    /// 寿命を過ぎた署名中のドキュメントを `Failed` にして読み直す。
    async fn expire_if_abandoned(&self, document: Document) -> Result<Document, SigningError> {
        let ttl = self.client.policy().session_ttl;
        if !document.session_expired(ttl.as_secs(), unix_now()) {
            return Ok(document);
        }
        let Some(stale) = document.active_session.clone() else {
            return Ok(document);
        };
        if self.mark_failed_if_owner(&document.id, &stale, EXPIRED_REASON).await? {
            tracing::warn!(
                document_id = %document.id,
                session_id = %stale,
                ttl_secs = ttl.as_secs(),
                "寿命を過ぎたセッションを失効"
            );
        }
        Ok(self.repo.load_document(&document.id).await?)
    }

    /// トークンを確認して完了を待つ。失敗時はドキュメントを解放する。
    async fn finish(
        &self,
        document: Document,
        mut session: SigningSession,
        cancel: &CancellationToken,
    ) -> Result<Signature, SigningError> {
        let owns_document = session.subject_id == document.id
            && document.status == DocumentStatus::Signing
            && document.active_session.as_deref() == Some(session.id.as_str());
        if !owns_document {
            return Err(SigningError::InvalidState(format!(
                "document {} に有効な署名セッション {} がありません",
                document.id, session.id
            )));
        }

        match self.run(&document, &mut session, cancel).await {
            Ok(signature) => Ok(signature),
            Err(e) => {
                self.release(&document.id, &session.id, &e).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        document: &Document,
        session: &mut SigningSession,
        cancel: &CancellationToken,
    ) -> Result<Signature, SigningError> {
        let data = self.storage.read_file(&document.blob_ref).await?;
        let payload = SigningPayload {
            name: document.title.clone(),
            filename: document.filename.clone(),
            mime_type: document.mime_type.clone(),
            data,
        };

        let artifact = self.client.complete(session, &payload, cancel).await?;

        let signature_key = format!("signatures/{}/{}.cms", document.id, document.filename);
        let blob_ref = self
            .storage
            .write_file(&signature_key, &artifact.signature_der)
            .await?;
        let registration = self
            .register(document, &payload, &artifact.signature_der)
            .await;

        // ポーリング中に所有権が移っていないことを確認する
        let current = self.repo.load_document(&document.id).await?;
        if current.active_session.as_deref() != Some(session.id.as_str()) {
            return Err(SigningError::InvalidState(format!(
                "document {} のセッション {} は無効になりました",
                document.id, session.id
            )));
        }

        let signature = Signature {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document.id.clone(),
            blob_ref,
            signer: artifact.signer,
            created_at: unix_now(),
        };
        self.repo.save_signature(&signature).await?;
        self.commit_signed(&document.id, &signature.id, registration.as_ref())
            .await?;

        tracing::info!(
            document_id = %document.id,
            signature_id = %signature.id,
            signer_iin = %signature.signer.iin,
            "ドキュメントを署名済みに更新"
        );
        Ok(signature)
    }

    /// 署名機関に登録し、署名済みコピーを保存する: `(登録ID, コピーの参照)`。
    ///
    /// 署名そのものは有効なため、登録の失敗は署名を失敗させない。
    async fn register(
        &self,
        document: &Document,
        payload: &SigningPayload,
        signature_der: &[u8],
    ) -> Option<(String, String)> {
        let authority_document_id = match self.client.register(payload, signature_der).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    document_id = %document.id,
                    error = %e,
                    "署名機関への登録に失敗"
                );
                return None;
            }
        };
        let key = format!(
            "documents/{}/{}",
            document.id,
            document.signed_copy_filename(&authority_document_id)
        );
        match self.storage.write_file(&key, &payload.data).await {
            Ok(copy_ref) => Some((authority_document_id, copy_ref)),
            Err(e) => {
                tracing::warn!(
                    document_id = %document.id,
                    error = %e,
                    "署名済みコピーの保存に失敗"
                );
                None
            }
        }
    }

    /// 署名レコードを保存したドキュメントを `Signed` にする。
    ///
    /// 署名レコードがある以上、所有権トークンが移っていても確定する。
    async fn commit_signed(
        &self,
        document_id: &str,
        signature_id: &str,
        registration: Option<&(String, String)>,
    ) -> Result<(), SigningError> {
        let mut last_conflict = None;
        for attempt in 1..=COMMIT_ATTEMPTS {
            let mut current = self.repo.load_document(document_id).await?;
            current.mark_signed(signature_id);
            if let Some((authority_document_id, copy_ref)) = registration {
                current.mark_registered(authority_document_id, copy_ref);
            }
            match self.repo.save_document(&current).await {
                Ok(_) => return Ok(()),
                Err(RepositoryError::Conflict(msg)) => {
                    tracing::debug!(
                        document_id = %document_id,
                        attempt,
                        "署名の確定が競合したため再試行"
                    );
                    last_conflict = Some(msg);
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SigningError::StorageUnavailable(format!(
            "document {document_id} の署名を確定できません: {}",
            last_conflict.unwrap_or_default()
        )))
    }

    /// セッションが失敗したドキュメントを `Failed` にしてトークンを外す。
    async fn release(&self, document_id: &str, session_id: &str, cause: &SigningError) {
        let reason = cause.failure_reason();
        match self.mark_failed_if_owner(document_id, session_id, &reason).await {
            Ok(true) => tracing::warn!(
                document_id = %document_id,
                session_id = %session_id,
                reason = %reason,
                "ドキュメントを署名失敗に更新"
            ),
            Ok(false) => {}
            Err(e) => tracing::error!(
                document_id = %document_id,
                session_id = %session_id,
                error = %e,
                "署名失敗の記録に失敗"
            ),
        }
    }

    /// トークンが既に別のセッションに移っている場合は何もせず `false` を返す。
    async fn mark_failed_if_owner(
        &self,
        document_id: &str,
        session_id: &str,
        reason: &str,
    ) -> Result<bool, RepositoryError> {
        for _ in 0..COMMIT_ATTEMPTS {
            let mut current = self.repo.load_document(document_id).await?;
            if current.active_session.as_deref() != Some(session_id) {
                return Ok(false);
            }
            current.mark_failed(reason);
            match self.repo.save_document(&current).await {
                Ok(_) => return Ok(true),
                Err(RepositoryError::Conflict(_)) => tokio::task::yield_now().await,
                Err(e) => return Err(e),
            }
        }
        Err(RepositoryError::Conflict(format!(
            "document {document_id} を失敗状態に更新できません"
        )))
    }
}
