//! # 検証サービス
//!
//! アップロード時から検証時までのデータ完全性を確認する。
//! 1. 保存されたファイルのダイジェストを再計算し、アップロード時の値と比較する
//! 2. 署名BlobがCMS SignedDataとして解析でき、署名対象ダイジェストが一致することを確認する
//! 3. 署名機関に登録済みなら、署名機関にも検証させる
//!
//! 証明書チェーンの信頼性と失効はこのサービス自身では確認しない。

use std::sync::Arc;

use qrsign_types::Document;

use crate::authority::ExternalSigningClient;
use crate::error::{AuthorityError, SigningError};
use crate::orchestrator::ensure_owner;
use crate::ports::{BlobStorage, Repository};

/// 検証結果。完全性の問題はエラーではなく結果として返す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// ファイルと署名が一致する
    Valid,
    /// ダイジェストが一致しない
    ChecksumMismatch {
        /// 期待したダイジェスト（アップロード時）
        expected: String,
        /// 実際のダイジェスト
        actual: String,
    },
    /// 署名Blobが構造的に不正
    MalformedSignature(String),
    /// 署名がない
    NotSigned,
}

impl VerificationOutcome {
    /// API表現の種別名。
    pub fn kind(&self) -> &'static str {
        match self {
            VerificationOutcome::Valid => "valid",
            VerificationOutcome::ChecksumMismatch { .. } => "checksum_mismatch",
            VerificationOutcome::MalformedSignature(_) => "malformed_signature",
            VerificationOutcome::NotSigned => "not_signed",
        }
    }

    /// 詳細メッセージ。
    pub fn detail(&self) -> Option<String> {
        match self {
            VerificationOutcome::ChecksumMismatch { expected, actual } => {
                Some(format!("expected {expected}, got {actual}"))
            }
            VerificationOutcome::MalformedSignature(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}

/// 検証結果と、署名機関側の検証結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    /// ローカルの検証結果
    pub outcome: VerificationOutcome,
    /// 署名機関の判定。未登録、または署名機関に到達できない場合は `None`
    pub authority_verified: Option<bool>,
}

impl VerificationReport {
    /// ローカルの検証が通り、署名機関も否定していない。
    pub fn verified(&self) -> bool {
        self.outcome == VerificationOutcome::Valid && self.authority_verified != Some(false)
    }
}

/// 署名Blobを解析し、署名対象ダイジェストを期待値と比較する。
pub fn check_envelope(signature_der: &[u8], expected_digest: &str) -> VerificationOutcome {
    let envelope = match qrsign_crypto::parse_signed_data(signature_der) {
        Ok(envelope) => envelope,
        Err(e) => return VerificationOutcome::MalformedSignature(e.to_string()),
    };
    if !envelope.uses_sha256() {
        return VerificationOutcome::MalformedSignature(format!(
            "未対応のダイジェストアルゴリズム: {}",
            envelope.digest_algorithm
        ));
    }

    let signed = qrsign_crypto::hex_digest(&envelope.signed_digest);
    if !signed.eq_ignore_ascii_case(expected_digest) {
        return VerificationOutcome::ChecksumMismatch {
            expected: expected_digest.to_string(),
            actual: signed,
        };
    }
    VerificationOutcome::Valid
}

/// 検証サービス。
pub struct VerificationService {
    repo: Arc<dyn Repository>,
    storage: Arc<dyn BlobStorage>,
    client: ExternalSigningClient,
}

impl VerificationService {
    /// ポートと署名機関クライアントから構築する。
    pub fn new(
        repo: Arc<dyn Repository>,
        storage: Arc<dyn BlobStorage>,
        client: ExternalSigningClient,
    ) -> Self {
        Self {
            repo,
            storage,
            client,
        }
    }

    /// 所有者を確認してからドキュメントを検証する。
    pub async fn verify_document(
        &self,
        document_id: &str,
        owner_id: &str,
    ) -> Result<VerificationReport, SigningError> {
        let document = self.repo.load_document(document_id).await?;
        ensure_owner(&document.owner_id, owner_id, document_id)?;

        let stored = self.storage.read_file(&document.blob_ref).await?;
        let outcome = self.check(&document, &stored).await?;
        let authority_verified = match &document.authority_document_id {
            Some(authority_document_id) => {
                self.verify_with_authority(&document, authority_document_id, &stored)
                    .await
            }
            None => None,
        };
        Ok(VerificationReport {
            outcome,
            authority_verified,
        })
    }

    /// ドキュメントを検証する。
    ///
    /// ストレージやリポジトリに到達できない場合だけ `Err` を返す。
    pub async fn verify(&self, document: &Document) -> Result<VerificationOutcome, SigningError> {
        let stored = self.storage.read_file(&document.blob_ref).await?;
        self.check(document, &stored).await
    }

    async fn verify_with_authority(
        &self,
        document: &Document,
        authority_document_id: &str,
        stored: &[u8],
    ) -> Option<bool> {
        match self.client.verify_registered(authority_document_id, stored).await {
            Ok(verified) => Some(verified),
            Err(AuthorityError::Rejected(reason)) => {
                tracing::warn!(
                    document_id = %document.id,
                    reason = %reason,
                    "署名機関が検証を拒否"
                );
                Some(false)
            }
            Err(AuthorityError::Unreachable(msg)) => {
                tracing::warn!(
                    document_id = %document.id,
                    error = %msg,
                    "署名機関で検証できません"
                );
                None
            }
        }
    }

    async fn check(
        &self,
        document: &Document,
        stored: &[u8],
    ) -> Result<VerificationOutcome, SigningError> {
        let actual = qrsign_crypto::content_digest(stored);
        if actual != document.digest {
            tracing::warn!(
                document_id = %document.id,
                expected = %document.digest,
                actual = %actual,
                "保存ファイルのダイジェストが一致しません"
            );
            return Ok(VerificationOutcome::ChecksumMismatch {
                expected: document.digest.clone(),
                actual,
            });
        }

        let Some(signature) = self.repo.signature_for_document(&document.id).await? else {
            return Ok(VerificationOutcome::NotSigned);
        };
        let signature_der = self.storage.read_file(&signature.blob_ref).await?;
        let outcome = check_envelope(&signature_der, &document.digest);

        tracing::info!(
            document_id = %document.id,
            outcome = outcome.kind(),
            "ドキュメントを検証"
        );
        Ok(outcome)
    }
}
