use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use qrsign_core::{
    AuthorityError, AuthorityPoll, AuthoritySession, InMemoryBlobStorage, OrchestratorConfig,
    PollPolicy, SigningAuthority, SigningError, SigningPayload,
};
use qrsign_crypto::fixtures;
use qrsign_types::{
    CompletePackageRequest, CompleteRequest, CreatePackageRequest, DocumentStatus, PackageStatus,
    SignerIdentity,
};

use super::*;
use crate::endpoints::documents::UploadQuery;
use crate::endpoints::Owner;
use crate::error::GatewayError;

const OWNER: &str = "owner-1";

/// テスト用の署名機関。`sign` が真なら最初のポーリングで署名を返す。
struct MockAuthority {
    sign: bool,
    submitted: Mutex<HashMap<String, [u8; 32]>>,
    sessions: Mutex<u32>,
    registered: Mutex<Vec<Option<[u8; 32]>>>,
}

impl MockAuthority {
    fn new(sign: bool) -> Self {
        Self {
            sign,
            submitted: Mutex::new(HashMap::new()),
            sessions: Mutex::new(0),
            registered: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl SigningAuthority for MockAuthority {
    async fn open_session(&self, _description: &str) -> Result<AuthoritySession, AuthorityError> {
        let mut sessions = self.sessions.lock().unwrap();
        *sessions += 1;
        Ok(AuthoritySession {
            external_id: format!("ext-{sessions}"),
            qr_image: b"QR".to_vec(),
            data_url: format!("mock://{sessions}/data"),
            sign_url: format!("mock://{sessions}/sign"),
            mobile_link: Some(format!("egov://mobile/{sessions}")),
            business_link: None,
        })
    }

    async fn submit_document(
        &self,
        data_url: &str,
        payload: &SigningPayload,
    ) -> Result<(), AuthorityError> {
        let key = data_url.trim_end_matches("/data").to_string();
        self.submitted
            .lock()
            .unwrap()
            .insert(key, qrsign_crypto::sha256(&payload.data));
        Ok(())
    }

    async fn fetch_signature(&self, sign_url: &str) -> Result<AuthorityPoll, AuthorityError> {
        if !self.sign {
            return Ok(AuthorityPoll::Pending);
        }
        let key = sign_url.trim_end_matches("/sign");
        let digest = self.submitted.lock().unwrap().get(key).copied();
        match digest {
            Some(digest) => Ok(AuthorityPoll::Signed(fixtures::detached_signed_data(
                &digest,
                &fixtures::individual_subject(),
            ))),
            None => Ok(AuthorityPoll::Pending),
        }
    }

    async fn register_document(
        &self,
        _title: &str,
        _description: &str,
        _signature_der: &[u8],
    ) -> Result<String, AuthorityError> {
        let mut registered = self.registered.lock().unwrap();
        registered.push(None);
        Ok(registered.len().to_string())
    }

    async fn upload_document_data(
        &self,
        authority_document_id: &str,
        data: &[u8],
    ) -> Result<(), AuthorityError> {
        let index = registered_index(authority_document_id)?;
        let mut registered = self.registered.lock().unwrap();
        let slot = registered
            .get_mut(index)
            .ok_or_else(|| AuthorityError::Rejected(authority_document_id.into()))?;
        *slot = Some(qrsign_crypto::sha256(data));
        Ok(())
    }

    async fn verify_document(
        &self,
        authority_document_id: &str,
        data: &[u8],
    ) -> Result<bool, AuthorityError> {
        let index = registered_index(authority_document_id)?;
        let registered = self.registered.lock().unwrap();
        Ok(registered.get(index).copied().flatten() == Some(qrsign_crypto::sha256(data)))
    }
}

fn registered_index(authority_document_id: &str) -> Result<usize, AuthorityError> {
    authority_document_id
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .ok_or_else(|| AuthorityError::Rejected(authority_document_id.into()))
}

fn test_state(sign: bool, max_retries: u32) -> Arc<GatewayState> {
    let config = OrchestratorConfig {
        poll: PollPolicy {
            max_retries,
            interval: Duration::from_millis(5),
            deadline: Duration::from_secs(10),
            session_ttl: Duration::from_secs(20),
            submit_retry_interval: Duration::from_millis(1),
        },
        package_concurrency: 2,
    };
    Arc::new(GatewayState::new(
        Arc::new(InMemoryRepository::new()),
        Arc::new(InMemoryBlobStorage::new()),
        Arc::new(MockAuthority::new(sign)),
        config,
        1024,
    ))
}

fn owner() -> Owner {
    Owner(OWNER.into())
}

fn signer() -> Json<SignerIdentity> {
    Json(SignerIdentity::individual("123456789012", "Test User").unwrap())
}

async fn upload(
    state: &Arc<GatewayState>,
    filename: &str,
    data: &[u8],
    package_id: Option<&str>,
) -> Result<qrsign_types::Document, GatewayError> {
    let (status, Json(document)) = handle_upload(
        State(state.clone()),
        owner(),
        Query(UploadQuery {
            filename: filename.into(),
            title: None,
            package_id: package_id.map(str::to_string),
        }),
        HeaderMap::new(),
        Bytes::copy_from_slice(data),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    Ok(document)
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

/// アップロード → 署名 → 検証 → ダウンロードの一連の流れ
#[tokio::test]
async fn test_document_signing_flow() {
    let state = test_state(true, 5);
    let document = upload(&state, "contract.pdf", b"%PDF-1.7 contract", None)
        .await
        .unwrap();
    assert_eq!(document.status, DocumentStatus::Uploaded);

    let Json(view) = handle_sign_document(
        State(state.clone()),
        owner(),
        Path(document.id.clone()),
        signer(),
    )
    .await
    .unwrap();
    assert_eq!(view.document_id, document.id);
    assert_eq!(view.qr_code_base64, "UVI=");
    assert_eq!(state.sessions.pending_count().await, 1);

    let Json(signature) = handle_complete_document(
        State(state.clone()),
        owner(),
        Path(document.id.clone()),
        Json(CompleteRequest {
            session_id: view.session_id.clone(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(signature.document_id, document.id);
    assert_eq!(signature.signer.iin, "123456789012");
    assert_eq!(state.sessions.pending_count().await, 0);

    let Json(status) = handle_get_document(State(state.clone()), owner(), Path(document.id.clone()))
        .await
        .unwrap();
    assert_eq!(status.document.status, DocumentStatus::Signed);
    assert_eq!(status.signature.unwrap().id, signature.id);

    let Json(verified) = handle_verify(State(state.clone()), owner(), Path(document.id.clone()))
        .await
        .unwrap();
    assert_eq!(verified.outcome, "valid");
    assert!(verified.detail.is_none());
    assert!(verified.verified);
    assert_eq!(verified.authority_verified, Some(true));

    let response = handle_download_signed_copy(State(state.clone()), owner(), Path(document.id.clone()))
        .await
        .unwrap();
    assert_eq!(
        response.headers()["content-disposition"],
        "attachment; filename=\"contract-sigex1.pdf\""
    );
    assert_eq!(body_bytes(response).await, b"%PDF-1.7 contract");

    let response = handle_download_document(State(state.clone()), owner(), Path(document.id.clone()))
        .await
        .unwrap();
    assert_eq!(response.headers()["content-type"], "application/pdf");
    assert_eq!(body_bytes(response).await, b"%PDF-1.7 contract");

    let response = handle_download_signature(State(state.clone()), owner(), Path(document.id.clone()))
        .await
        .unwrap();
    assert_eq!(
        response.headers()["content-disposition"],
        "attachment; filename=\"contract.pdf.cms\""
    );
    assert!(!body_bytes(response).await.is_empty());

    let Json(documents) = handle_list_documents(State(state), owner()).await.unwrap();
    assert_eq!(documents.len(), 1);
}

#[tokio::test]
async fn test_upload_limits() {
    let state = test_state(true, 5);

    let err = upload(&state, "big.pdf", &[0u8; 2048], None).await.unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::PAYLOAD_TOO_LARGE);

    let err = upload(&state, "notes.txt", b"text", None).await.unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

    let err = upload(&state, "empty.pdf", b"", None).await.unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_complete_requires_known_session() {
    let state = test_state(true, 5);
    let document = upload(&state, "a.pdf", b"%PDF a", None).await.unwrap();

    let err = handle_complete_document(
        State(state),
        owner(),
        Path(document.id),
        Json(CompleteRequest {
            session_id: "unknown".into(),
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_second_initiation_conflicts() {
    let state = test_state(true, 5);
    let document = upload(&state, "a.pdf", b"%PDF a", None).await.unwrap();

    handle_sign_document(State(state.clone()), owner(), Path(document.id.clone()), signer())
        .await
        .unwrap();
    let err = handle_sign_document(State(state), owner(), Path(document.id), signer())
        .await
        .unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_other_owner_is_forbidden() {
    let state = test_state(true, 5);
    let document = upload(&state, "a.pdf", b"%PDF a", None).await.unwrap();

    let err = handle_get_document(State(state.clone()), Owner("intruder".into()), Path(document.id.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);

    let Json(view) = handle_sign_document(State(state.clone()), owner(), Path(document.id.clone()), signer())
        .await
        .unwrap();
    let err = handle_complete_document(
        State(state.clone()),
        Owner("intruder".into()),
        Path(document.id),
        Json(CompleteRequest {
            session_id: view.session_id,
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    assert_eq!(state.sessions.pending_count().await, 1);
}

#[tokio::test]
async fn test_unsigned_document_times_out() {
    let state = test_state(false, 3);
    let document = upload(&state, "a.pdf", b"%PDF a", None).await.unwrap();
    let Json(view) = handle_sign_document(State(state.clone()), owner(), Path(document.id.clone()), signer())
        .await
        .unwrap();

    let err = handle_complete_document(
        State(state.clone()),
        owner(),
        Path(document.id.clone()),
        Json(CompleteRequest {
            session_id: view.session_id,
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::GATEWAY_TIMEOUT);

    let Json(status) = handle_get_document(State(state), owner(), Path(document.id))
        .await
        .unwrap();
    assert_eq!(status.document.status, DocumentStatus::Failed);
    assert_eq!(status.document.failure_reason.as_deref(), Some("timeout"));
}

/// リクエストが切断されると完了処理はキャンセルされ、ドキュメントは Failed になる
#[tokio::test]
async fn test_dropped_request_cancels_completion() {
    let state = test_state(false, 10_000);
    let document = upload(&state, "a.pdf", b"%PDF a", None).await.unwrap();
    let Json(view) = handle_sign_document(State(state.clone()), owner(), Path(document.id.clone()), signer())
        .await
        .unwrap();

    let request = handle_complete_document(
        State(state.clone()),
        owner(),
        Path(document.id.clone()),
        Json(CompleteRequest {
            session_id: view.session_id,
        }),
    );
    assert!(tokio::time::timeout(Duration::from_millis(50), request)
        .await
        .is_err());

    let mut status = DocumentStatus::Signing;
    for _ in 0..100 {
        let Json(current) = handle_get_document(State(state.clone()), owner(), Path(document.id.clone()))
            .await
            .unwrap();
        status = current.document.status;
        if status != DocumentStatus::Signing {
            assert_eq!(current.document.failure_reason.as_deref(), Some("cancelled"));
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, DocumentStatus::Failed);
}

/// パッケージの作成 → 署名 → アーカイブ
#[tokio::test]
async fn test_package_flow() {
    let state = test_state(true, 5);
    let (status, Json(package)) = handle_create_package(
        State(state.clone()),
        owner(),
        Json(CreatePackageRequest {
            title: "Deal".into(),
            description: "two files".into(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(status, StatusCode::CREATED);

    let a = upload(&state, "a.pdf", b"%PDF a", Some(&package.id)).await.unwrap();
    let b = upload(&state, "b.png", b"PNG b", None).await.unwrap();
    let Json(updated) = handle_add_document(
        State(state.clone()),
        owner(),
        Path((package.id.clone(), b.id.clone())),
    )
    .await
    .unwrap();
    assert_eq!(updated.document_ids, vec![a.id.clone(), b.id.clone()]);

    let Json(members) = handle_sign_package(State(state.clone()), owner(), Path(package.id.clone()), signer())
        .await
        .unwrap();
    assert_eq!(members.len(), 2);
    assert!(members.iter().all(|m| m.status == "started"));
    let session_ids: Vec<String> = members
        .iter()
        .map(|m| m.session.as_ref().unwrap().session_id.clone())
        .collect();

    let Json(report) = handle_complete_package(
        State(state.clone()),
        owner(),
        Path(package.id.clone()),
        Json(CompletePackageRequest { session_ids }),
    )
    .await
    .unwrap();
    assert_eq!(report.status, PackageStatus::Signed);
    assert_eq!(report.members[0].document_id, a.id);

    let Json(summaries) = handle_list_packages(State(state.clone()), owner()).await.unwrap();
    assert_eq!(summaries[0].status, PackageStatus::Signed);
    assert_eq!(summaries[0].document_count, 2);

    let response = handle_download_archive(State(state.clone()), owner(), Path(package.id.clone()))
        .await
        .unwrap();
    assert_eq!(response.headers()["content-type"], "application/zip");
    let archive = body_bytes(response).await;
    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
    let names: Vec<String> = (0..zip.len())
        .map(|i| zip.by_index(i).unwrap().name().to_string())
        .collect();
    assert_eq!(
        names,
        vec![
            "originals/a.pdf",
            "originals/b.png",
            "signatures/a.pdf.cms",
            "signatures/b.png.cms",
        ]
    );
    let mut original = Vec::new();
    zip.by_name("originals/b.png")
        .unwrap()
        .read_to_end(&mut original)
        .unwrap();
    assert_eq!(original, b"PNG b");

    let Json(report) = handle_get_package(State(state), owner(), Path(package.id))
        .await
        .unwrap();
    assert_eq!(report.status, PackageStatus::Signed);
}

/// 別パッケージのセッションを混ぜた完了要求は、どのセッションも消費しない
#[tokio::test]
async fn test_stray_session_in_package_complete_is_restored() {
    let state = test_state(true, 5);
    let (_, Json(package)) = handle_create_package(
        State(state.clone()),
        owner(),
        Json(CreatePackageRequest {
            title: "Deal".into(),
            description: String::new(),
        }),
    )
    .await
    .unwrap();
    upload(&state, "a.pdf", b"%PDF a", Some(&package.id)).await.unwrap();
    let standalone = upload(&state, "b.pdf", b"%PDF b", None).await.unwrap();

    let Json(members) = handle_sign_package(State(state.clone()), owner(), Path(package.id.clone()), signer())
        .await
        .unwrap();
    let member_session = members[0].session.as_ref().unwrap().session_id.clone();
    let Json(stray) = handle_sign_document(State(state.clone()), owner(), Path(standalone.id.clone()), signer())
        .await
        .unwrap();

    let err = handle_complete_package(
        State(state.clone()),
        owner(),
        Path(package.id.clone()),
        Json(CompletePackageRequest {
            session_ids: vec![member_session.clone(), stray.session_id.clone()],
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    assert_eq!(state.sessions.pending_count().await, 2);

    let Json(signature) = handle_complete_document(
        State(state.clone()),
        owner(),
        Path(standalone.id.clone()),
        Json(CompleteRequest {
            session_id: stray.session_id,
        }),
    )
    .await
    .unwrap();
    assert_eq!(signature.document_id, standalone.id);

    let Json(report) = handle_complete_package(
        State(state.clone()),
        owner(),
        Path(package.id),
        Json(CompletePackageRequest {
            session_ids: vec![member_session],
        }),
    )
    .await
    .unwrap();
    assert_eq!(report.status, PackageStatus::Signed);

    let Json(status) = handle_get_document(State(state), owner(), Path(standalone.id))
        .await
        .unwrap();
    assert_eq!(status.document.status, DocumentStatus::Signed);
}

#[tokio::test]
async fn test_abandoned_sessions_are_expired() {
    let state = test_state(true, 5);
    let document = upload(&state, "a.pdf", b"%PDF a", None).await.unwrap();
    handle_sign_document(State(state.clone()), owner(), Path(document.id.clone()), signer())
        .await
        .unwrap();

    assert_eq!(expire_abandoned_sessions(&state, Duration::from_secs(60)).await, 0);
    assert_eq!(state.sessions.pending_count().await, 1);

    assert_eq!(expire_abandoned_sessions(&state, Duration::ZERO).await, 1);
    assert_eq!(state.sessions.pending_count().await, 0);

    let Json(status) = handle_get_document(State(state.clone()), owner(), Path(document.id.clone()))
        .await
        .unwrap();
    assert_eq!(status.document.status, DocumentStatus::Failed);
    assert_eq!(status.document.failure_reason.as_deref(), Some("expired"));

    // 失効したドキュメントは再署名できる
    handle_sign_document(State(state), owner(), Path(document.id), signer())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unregistered_document_has_no_signed_copy() {
    let state = test_state(true, 5);
    let document = upload(&state, "a.pdf", b"%PDF a", None).await.unwrap();

    let err = handle_download_signed_copy(State(state), owner(), Path(document.id))
        .await
        .unwrap_err();
    assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
}

#[test]
fn test_error_status_mapping() {
    let cases = [
        (SigningError::NotFound("x".into()), StatusCode::NOT_FOUND),
        (SigningError::SessionAlreadyActive("x".into()), StatusCode::CONFLICT),
        (SigningError::InvalidState("x".into()), StatusCode::CONFLICT),
        (SigningError::InvalidDocument("x".into()), StatusCode::BAD_REQUEST),
        (SigningError::AccessDenied("x".into()), StatusCode::FORBIDDEN),
        (SigningError::AuthorityUnreachable("x".into()), StatusCode::BAD_GATEWAY),
        (SigningError::AuthorityRejected("x".into()), StatusCode::BAD_GATEWAY),
        (
            SigningError::Timeout {
                attempts: 60,
                last_error: None,
            },
            StatusCode::GATEWAY_TIMEOUT,
        ),
        (SigningError::StorageUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
    ];
    for (error, expected) in cases {
        let label = error.to_string();
        assert_eq!(
            GatewayError::from(error).into_response().status(),
            expected,
            "{label}"
        );
    }
}

#[test]
fn test_router_builds() {
    let _ = router(test_state(true, 5));
}
