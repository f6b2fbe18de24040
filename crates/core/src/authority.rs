//! # 外部署名機関クライアント
//!
//! QR署名機関とのやり取りを2層に分ける。
//! - `SigningAuthority`: 1往復ずつのトランスポート（HTTP実装は `qrsign-sigex`）
//! - `ExternalSigningClient`: セッション作成と、キャンセル可能・期限付きの完了待ちループ
//!
//! ## 完了待ち
//! ```text
//! POST dataURL  ── 署名者がQRを読むまでブロック。通信エラーは予算内で再試行
//! GET  signURL  ── PENDING なら interval 待って再試行、SIGNED / REJECTED で終了
//! ```
//! データ送信とポーリングは同じ `max_retries` の予算を消費する。
//! 全体は `deadline` で打ち切られ、キャンセルトークンで即座に中断できる。
//! 中断しても署名機関側のセッションには何もしない。
//!
//! ## 署名後の登録
//! 取得した署名は原本と共に署名機関へ登録できる（`register`）。
//! 登録したドキュメントは後から署名機関側で検証できる（`verify_registered`）。

use std::sync::Arc;
use std::time::Duration;

use qrsign_types::{SessionState, SignerIdentity, SigningSession, SubjectKind};
use tokio_util::sync::CancellationToken;

use crate::error::{AuthorityError, SigningError};
use crate::PollPolicy;

/// 署名機関に登録されたセッション。
#[derive(Debug, Clone)]
pub struct AuthoritySession {
    /// 署名機関が割り当てたセッションID
    pub external_id: String,
    /// QRコード画像
    pub qr_image: Vec<u8>,
    /// 署名対象データの送信先
    pub data_url: String,
    /// 署名の取得先
    pub sign_url: String,
    /// 個人向けアプリ起動リンク
    pub mobile_link: Option<String>,
    /// 法人向けアプリ起動リンク
    pub business_link: Option<String>,
}

/// 署名機関へ送るドキュメント本体。
#[derive(Debug, Clone)]
pub struct SigningPayload {
    /// 署名アプリに表示する名前
    pub name: String,
    /// ファイル名
    pub filename: String,
    /// MIMEタイプ
    pub mime_type: String,
    /// ファイル本体
    pub data: Vec<u8>,
}

/// 署名取得1回分の応答。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityPoll {
    /// まだ署名されていない
    Pending,
    /// CMS署名（DER）
    Signed(Vec<u8>),
    /// 署名者が取り消した
    Rejected(String),
}

/// 署名機関トランスポート。各メソッドは1往復だけ行い、再試行はしない。
#[async_trait::async_trait]
pub trait SigningAuthority: Send + Sync {
    /// QR署名セッションを登録する。
    async fn open_session(&self, description: &str) -> Result<AuthoritySession, AuthorityError>;

    /// 署名対象データを送信する。署名者がQRを読むまで戻らないことがある。
    async fn submit_document(
        &self,
        data_url: &str,
        payload: &SigningPayload,
    ) -> Result<(), AuthorityError>;

    /// 署名の取得を1回試みる。
    async fn fetch_signature(&self, sign_url: &str) -> Result<AuthorityPoll, AuthorityError>;

    /// 署名付きでドキュメントを登録し、署名機関のドキュメントIDを返す。
    async fn register_document(
        &self,
        title: &str,
        description: &str,
        signature_der: &[u8],
    ) -> Result<String, AuthorityError>;

    /// 登録済みドキュメントに原本を送信する。
    async fn upload_document_data(
        &self,
        authority_document_id: &str,
        data: &[u8],
    ) -> Result<(), AuthorityError>;

    /// 登録済みドキュメントの署名を署名機関側で検証する。署名が一致しなければ `Ok(false)`。
    async fn verify_document(
        &self,
        authority_document_id: &str,
        data: &[u8],
    ) -> Result<bool, AuthorityError>;
}

/// セッション作成の対象。
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// 新しいセッションID（ドキュメントの所有権トークンとして先に確保済み）
    pub session_id: String,
    /// 対象種別
    pub subject_kind: SubjectKind,
    /// 対象ドキュメントID
    pub document_id: String,
    /// パッケージメンバーの場合のパッケージID
    pub package_id: Option<String>,
    /// 署名アプリに表示する説明
    pub description: String,
}

/// 完了した署名。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedArtifact {
    /// CMS署名（DER）
    pub signature_der: Vec<u8>,
    /// 署名機関が証明した署名者
    pub signer: SignerIdentity,
}

/// `ExternalSigningClient::poll` の結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// 署名待ち
    Pending,
    /// 署名済み
    Signed(SignedArtifact),
    /// 取り消し
    Rejected(String),
}

/// 外部署名機関のプロトコルアダプタ。
#[derive(Clone)]
pub struct ExternalSigningClient {
    authority: Arc<dyn SigningAuthority>,
    policy: PollPolicy,
}

impl ExternalSigningClient {
    /// トランスポートとポーリング方針から構築する。
    pub fn new(authority: Arc<dyn SigningAuthority>, policy: PollPolicy) -> Self {
        Self { authority, policy }
    }

    /// ポーリング方針。
    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// 署名機関にセッションを開き、`Initiated` 状態のセッションを返す。
    pub async fn initiate(
        &self,
        request: SessionRequest,
        payload_digest: &str,
        signer: &SignerIdentity,
    ) -> Result<SigningSession, SigningError> {
        let opened = self.authority.open_session(&request.description).await?;

        tracing::info!(
            session_id = %request.session_id,
            document_id = %request.document_id,
            external_id = %opened.external_id,
            "署名機関にセッションを登録"
        );

        Ok(SigningSession {
            id: request.session_id,
            subject_kind: request.subject_kind,
            subject_id: request.document_id,
            package_id: request.package_id,
            external_session_id: opened.external_id,
            data_url: opened.data_url,
            sign_url: opened.sign_url,
            qr_image: opened.qr_image,
            mobile_link: opened.mobile_link,
            business_link: opened.business_link,
            signer: signer.clone(),
            payload_digest: payload_digest.to_string(),
            state: SessionState::Initiated,
            retry_count: 0,
        })
    }

    /// 署名と原本を署名機関に登録し、署名機関のドキュメントIDを返す。
    pub async fn register(
        &self,
        payload: &SigningPayload,
        signature_der: &[u8],
    ) -> Result<String, AuthorityError> {
        let description = format!("Document: {}", payload.filename);
        let authority_document_id = self
            .authority
            .register_document(&payload.name, &description, signature_der)
            .await?;
        self.authority
            .upload_document_data(&authority_document_id, &payload.data)
            .await?;
        tracing::info!(
            authority_document_id = %authority_document_id,
            filename = %payload.filename,
            "署名機関にドキュメントを登録"
        );
        Ok(authority_document_id)
    }

    /// 登録済みドキュメントを署名機関側で検証する。
    pub async fn verify_registered(
        &self,
        authority_document_id: &str,
        data: &[u8],
    ) -> Result<bool, AuthorityError> {
        self.authority
            .verify_document(authority_document_id, data)
            .await
    }

    /// 署名URLを1回だけ問い合わせる。
    pub async fn poll(&self, session: &SigningSession) -> Result<PollOutcome, AuthorityError> {
        Ok(match self.authority.fetch_signature(&session.sign_url).await? {
            AuthorityPoll::Pending => PollOutcome::Pending,
            AuthorityPoll::Rejected(reason) => PollOutcome::Rejected(reason),
            AuthorityPoll::Signed(signature_der) => {
                let signer = attested_signer(&signature_der, &session.signer);
                PollOutcome::Signed(SignedArtifact {
                    signature_der,
                    signer,
                })
            }
        })
    }

    /// 署名が得られるまで待つ。
    ///
    /// 終了時にセッションを `Completed` / `Failed` / `Timeout` のいずれかに進める。
    pub async fn complete(
        &self,
        session: &mut SigningSession,
        payload: &SigningPayload,
        cancel: &CancellationToken,
    ) -> Result<SignedArtifact, SigningError> {
        session.advance(SessionState::Polling)?;

        let outcome =
            tokio::time::timeout(self.policy.deadline, self.drive(session, payload, cancel)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(SigningError::Timeout {
                attempts: session.retry_count,
                last_error: Some("deadline exceeded".to_string()),
            }),
        };

        let terminal = match &result {
            Ok(_) => SessionState::Completed,
            Err(SigningError::Timeout { .. }) => SessionState::Timeout,
            Err(_) => SessionState::Failed,
        };
        if let Err(e) = session.advance(terminal) {
            tracing::error!(session_id = %session.id, error = %e, "セッション状態を終端に進められません");
        }

        match &result {
            Ok(_) => tracing::info!(
                session_id = %session.id,
                attempts = session.retry_count,
                "署名を取得"
            ),
            Err(e) => tracing::warn!(
                session_id = %session.id,
                attempts = session.retry_count,
                error = %e,
                "署名待ちが終了"
            ),
        }
        result
    }

    async fn drive(
        &self,
        session: &mut SigningSession,
        payload: &SigningPayload,
        cancel: &CancellationToken,
    ) -> Result<SignedArtifact, SigningError> {
        let mut last_error: Option<String> = None;
        let mut answered = false;

        loop {
            if session.retry_count >= self.policy.max_retries {
                return Err(exhausted(session.retry_count, answered, last_error));
            }
            session.retry_count += 1;

            let submitted = tokio::select! {
                _ = cancel.cancelled() => return Err(SigningError::Cancelled),
                r = self.authority.submit_document(&session.data_url, payload) => r,
            };
            match submitted {
                Ok(()) => {
                    answered = true;
                    break;
                }
                Err(AuthorityError::Rejected(reason)) => {
                    return Err(SigningError::AuthorityRejected(reason))
                }
                Err(AuthorityError::Unreachable(msg)) => {
                    tracing::warn!(
                        session_id = %session.id,
                        attempt = session.retry_count,
                        error = %msg,
                        "署名データの送信に失敗"
                    );
                    last_error = Some(msg);
                    pause(self.policy.submit_retry_interval, cancel).await?;
                }
            }
        }

        loop {
            if session.retry_count >= self.policy.max_retries {
                return Err(exhausted(session.retry_count, answered, last_error));
            }
            session.retry_count += 1;

            let polled = tokio::select! {
                _ = cancel.cancelled() => return Err(SigningError::Cancelled),
                r = self.poll(session) => r,
            };
            match polled {
                Ok(PollOutcome::Signed(artifact)) => return Ok(artifact),
                Ok(PollOutcome::Rejected(reason)) | Err(AuthorityError::Rejected(reason)) => {
                    return Err(SigningError::AuthorityRejected(reason))
                }
                Ok(PollOutcome::Pending) => {
                    answered = true;
                    tracing::debug!(
                        session_id = %session.id,
                        attempt = session.retry_count,
                        "署名待ち"
                    );
                }
                Err(AuthorityError::Unreachable(msg)) => {
                    tracing::warn!(
                        session_id = %session.id,
                        attempt = session.retry_count,
                        error = %msg,
                        "署名の取得に失敗"
                    );
                    last_error = Some(msg);
                }
            }

            if session.retry_count < self.policy.max_retries {
                pause(self.policy.interval, cancel).await?;
            }
        }
    }
}

/// キャンセル可能な待機。
async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<(), SigningError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SigningError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// 予算切れのエラー。署名機関から一度も応答がなかった場合は到達不能として扱う。
fn exhausted(attempts: u32, answered: bool, last_error: Option<String>) -> SigningError {
    match last_error {
        Some(msg) if !answered => SigningError::AuthorityUnreachable(msg),
        last_error => SigningError::Timeout {
            attempts,
            last_error,
        },
    }
}

/// CMS署名に同梱された証明書から署名者を取り出す。
///
/// 証明書がない、またはIINを読めない場合は署名を要求した署名者を返す。
fn attested_signer(signature_der: &[u8], requested: &SignerIdentity) -> SignerIdentity {
    let subject = match qrsign_crypto::parse_signed_data(signature_der) {
        Ok(envelope) => envelope.signer_subject,
        Err(e) => {
            tracing::warn!(error = %e, "署名エンベロープから署名者を取得できません");
            None
        }
    };
    let Some(subject) = subject else {
        return requested.clone();
    };
    let Some(iin) = subject.iin() else {
        return requested.clone();
    };
    let full_name = subject
        .common_name
        .clone()
        .unwrap_or_else(|| requested.full_name.clone());

    let attested = match (subject.bin(), subject.organization.as_deref()) {
        (Some(bin), Some(company)) => {
            SignerIdentity::legal_entity(iin, &full_name, bin, company)
        }
        _ => SignerIdentity::individual(iin, &full_name),
    };
    attested.unwrap_or_else(|_| requested.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{fast_policy, individual, session_request, PollMode, ScriptedAuthority};
    use qrsign_types::SignerType;

    fn payload() -> SigningPayload {
        SigningPayload {
            name: "Contract".into(),
            filename: "contract.pdf".into(),
            mime_type: "application/pdf".into(),
            data: b"%PDF-1.7 contract".to_vec(),
        }
    }

    async fn open(
        authority: Arc<ScriptedAuthority>,
        policy: PollPolicy,
    ) -> (ExternalSigningClient, SigningSession) {
        let client = ExternalSigningClient::new(authority, policy);
        let session = client
            .initiate(session_request("s1", "d1"), "00", &individual())
            .await
            .unwrap();
        (client, session)
    }

    #[tokio::test]
    async fn test_complete_returns_attested_signer() {
        let authority = Arc::new(ScriptedAuthority::new(PollMode::SignAfter(2)));
        let (client, mut session) = open(authority.clone(), fast_policy(10)).await;
        assert_eq!(session.state, SessionState::Initiated);
        assert!(!session.qr_image.is_empty());

        let artifact = client
            .complete(&mut session, &payload(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.state, SessionState::Completed);
        // 送信1回 + PENDING 2回 + SIGNED 1回
        assert_eq!(session.retry_count, 4);
        assert_eq!(artifact.signer.iin, "123456789012");
        assert_eq!(artifact.signer.full_name, "TEST USER");
        assert_eq!(authority.submits(), 1);
    }

    #[tokio::test]
    async fn test_legal_entity_certificate_is_attested() {
        let authority = Arc::new(ScriptedAuthority::new(PollMode::SignAfter(0)).legal_entity());
        let (client, mut session) = open(authority, fast_policy(5)).await;

        let artifact = client
            .complete(&mut session, &payload(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(artifact.signer.signer_type, SignerType::LegalEntity);
        assert_eq!(artifact.signer.bin.as_deref(), Some("111222333444"));
        assert_eq!(artifact.signer.company_name.as_deref(), Some("Test LLP"));
    }

    #[tokio::test]
    async fn test_never_signed_times_out_within_budget() {
        let authority = Arc::new(ScriptedAuthority::new(PollMode::NeverSign));
        let (client, mut session) = open(authority.clone(), fast_policy(5)).await;

        let err = client
            .complete(&mut session, &payload(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SigningError::Timeout { attempts: 5, .. }));
        assert_eq!(session.state, SessionState::Timeout);
        assert_eq!(authority.polls(), 4);
    }

    #[tokio::test]
    async fn test_rejection_short_circuits() {
        let authority = Arc::new(ScriptedAuthority::new(PollMode::Reject(
            "Подписание отменено".into(),
        )));
        let (client, mut session) = open(authority.clone(), fast_policy(10)).await;

        let err = client
            .complete(&mut session, &payload(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SigningError::AuthorityRejected(_)));
        assert_eq!(session.state, SessionState::Failed);
        assert_eq!(authority.polls(), 1);
    }

    #[tokio::test]
    async fn test_transient_submit_failures_are_retried() {
        let authority =
            Arc::new(ScriptedAuthority::new(PollMode::SignAfter(0)).failing_submits(2));
        let (client, mut session) = open(authority.clone(), fast_policy(10)).await;

        client
            .complete(&mut session, &payload(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(authority.submits(), 3);
        assert_eq!(session.retry_count, 4);
    }

    #[tokio::test]
    async fn test_unreachable_authority_exhausts_budget() {
        let authority = Arc::new(ScriptedAuthority::new(PollMode::SignAfter(0)).failing_submits(100));
        let (client, mut session) = open(authority, fast_policy(3)).await;

        let err = client
            .complete(&mut session, &payload(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SigningError::AuthorityUnreachable(_)));
        assert_eq!(session.state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let authority = Arc::new(ScriptedAuthority::new(PollMode::NeverSign));
        let mut policy = fast_policy(1000);
        policy.interval = Duration::from_secs(5);
        let (client, mut session) = open(authority.clone(), policy).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = client
            .complete(&mut session, &payload(), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, SigningError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.state, SessionState::Failed);
        assert_eq!(authority.polls(), 1);
    }

    #[tokio::test]
    async fn test_overall_deadline_is_enforced() {
        let authority = Arc::new(ScriptedAuthority::new(PollMode::NeverSign));
        let mut policy = fast_policy(1000);
        policy.deadline = Duration::from_millis(60);
        let (client, mut session) = open(authority, policy).await;

        let err = client
            .complete(&mut session, &payload(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SigningError::Timeout { .. }));
        assert_eq!(session.state, SessionState::Timeout);
    }

    #[tokio::test]
    async fn test_open_failure_is_typed() {
        let authority = Arc::new(
            ScriptedAuthority::new(PollMode::SignAfter(0))
                .failing_open(AuthorityError::Unreachable("connection refused".into())),
        );
        let client = ExternalSigningClient::new(authority, fast_policy(3));
        let err = client
            .initiate(session_request("s1", "d1"), "00", &individual())
            .await
            .unwrap_err();
        assert!(matches!(err, SigningError::AuthorityUnreachable(_)));
    }

    #[tokio::test]
    async fn test_register_and_verify_roundtrip() {
        let authority = Arc::new(ScriptedAuthority::new(PollMode::SignAfter(0)));
        let (client, _) = open(authority.clone(), fast_policy(3)).await;

        let id = client.register(&payload(), b"CMS").await.unwrap();
        assert_eq!(id, "1");
        assert!(client.verify_registered(&id, &payload().data).await.unwrap());
        assert!(!client.verify_registered(&id, b"altered").await.unwrap());
        assert!(matches!(
            client.verify_registered("missing", &payload().data).await,
            Err(AuthorityError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_terminal_session_is_not_advanced_again() {
        let authority = Arc::new(ScriptedAuthority::new(PollMode::SignAfter(0)));
        let (client, mut session) = open(authority, fast_policy(3)).await;
        client
            .complete(&mut session, &payload(), &CancellationToken::new())
            .await
            .unwrap();

        // 終端状態のセッションで再度完了待ちはできない
        let err = client
            .complete(&mut session, &payload(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SigningError::InvalidState(_)));
        assert_eq!(session.state, SessionState::Completed);
    }

    #[test]
    fn test_unparsable_signature_falls_back_to_requested_signer() {
        let requested = individual();
        assert_eq!(attested_signer(b"garbage", &requested), requested);
    }
}
