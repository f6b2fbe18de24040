//! # 署名API
//!
//! - `POST /documents/{id}/sign` → QRコードとセッションID
//! - `POST /documents/{id}/sign/complete` → 署名
//! - `POST /packages/{id}/sign` → メンバーごとのQRコード（メンバー順）
//! - `POST /packages/{id}/sign/complete` → パッケージの状態
//!
//! 完了処理は別タスクで実行し、HTTPリクエストが切断されるとキャンセルトークンで中断する。
//! 中断されたドキュメントは `Failed` になる。
//! 完了APIが呼ばれないまま寿命を過ぎたセッションは `expire_abandoned_sessions` が失効させる。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use base64::Engine;
use qrsign_core::{MemberStart, PackageReport, SigningError};
use qrsign_types::{
    CompletePackageRequest, CompleteRequest, SessionView, Signature, SignerIdentity,
    SigningSession,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::Owner;
use crate::config::GatewayState;
use crate::error::GatewayError;

/// パッケージメンバー1件の署名開始結果。
#[derive(Debug, Serialize)]
pub struct MemberSessionView {
    /// ドキュメントID
    pub document_id: String,
    /// `started` / `already_signed` / `failed`
    pub status: &'static str,
    /// 開始したセッション
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionView>,
    /// 開始に失敗した理由
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn session_view(session: &SigningSession) -> SessionView {
    SessionView {
        session_id: session.id.clone(),
        document_id: session.subject_id.clone(),
        qr_code_base64: qrsign_crypto::b64().encode(&session.qr_image),
        mobile_link: session.mobile_link.clone(),
        business_link: session.business_link.clone(),
    }
}

/// 完了処理を別タスクで実行する。呼び出し側のFutureが破棄されるとトークンがキャンセルされる。
async fn run_cancellable<T, F>(work: impl FnOnce(CancellationToken) -> F) -> Result<T, GatewayError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, SigningError>> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    tokio::spawn(work(cancel))
        .await
        .map_err(|e| GatewayError::Internal(format!("完了処理のタスクが異常終了: {e}")))?
        .map_err(GatewayError::from)
}

/// POST /documents/{id}/sign — 署名セッションを開始する。
pub async fn handle_sign_document(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
    Path(document_id): Path<String>,
    Json(signer): Json<SignerIdentity>,
) -> Result<Json<SessionView>, GatewayError> {
    let session = state
        .orchestrator
        .initiate_document(&document_id, &owner, &signer)
        .await?;
    let view = session_view(&session);
    state.sessions.insert(&owner, session).await;
    Ok(Json(view))
}

/// POST /documents/{id}/sign/complete — 署名の完了を待つ。
pub async fn handle_complete_document(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
    Path(document_id): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> Result<Json<Signature>, GatewayError> {
    let session = state.sessions.take(&body.session_id, &owner).await?;
    if session.subject_id != document_id {
        let message = format!(
            "session {} は document {document_id} のセッションではありません",
            session.id
        );
        state.sessions.insert(&owner, session).await;
        return Err(GatewayError::BadRequest(message));
    }

    let orchestrator = state.orchestrator.clone();
    let signature = run_cancellable(move |cancel| async move {
        orchestrator
            .complete_document(&document_id, &owner, session, &cancel)
            .await
    })
    .await?;
    Ok(Json(signature))
}

/// POST /packages/{id}/sign — 全メンバーの署名セッションを開始する。
pub async fn handle_sign_package(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
    Path(package_id): Path<String>,
    Json(signer): Json<SignerIdentity>,
) -> Result<Json<Vec<MemberSessionView>>, GatewayError> {
    let initiations = state
        .orchestrator
        .initiate_package(&package_id, &owner, &signer)
        .await?;

    let mut views = Vec::with_capacity(initiations.len());
    for initiation in initiations {
        let view = match initiation.start {
            MemberStart::Started(session) => {
                let view = session_view(&session);
                state.sessions.insert(&owner, session).await;
                MemberSessionView {
                    document_id: initiation.document_id,
                    status: "started",
                    session: Some(view),
                    error: None,
                }
            }
            MemberStart::AlreadySigned => MemberSessionView {
                document_id: initiation.document_id,
                status: "already_signed",
                session: None,
                error: None,
            },
            MemberStart::Failed(e) => MemberSessionView {
                document_id: initiation.document_id,
                status: "failed",
                session: None,
                error: Some(e.to_string()),
            },
        };
        views.push(view);
    }
    Ok(Json(views))
}

/// POST /packages/{id}/sign/complete — 全メンバーの完了を待ち、集約状態を返す。
pub async fn handle_complete_package(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
    Path(package_id): Path<String>,
    Json(body): Json<CompletePackageRequest>,
) -> Result<Json<PackageReport>, GatewayError> {
    let sessions = state.sessions.take_all(&body.session_ids, &owner).await?;
    if let Err(e) = state
        .orchestrator
        .check_package_sessions(&package_id, &owner, &sessions)
        .await
    {
        state.sessions.restore(&owner, sessions).await;
        return Err(e.into());
    }

    let orchestrator = state.orchestrator.clone();
    let report = run_cancellable(move |cancel| async move {
        orchestrator
            .complete_package(&package_id, &owner, sessions, &cancel)
            .await
    })
    .await?;
    Ok(Json(report))
}

/// 寿命を過ぎたセッションを表から取り除き、ドキュメントを `Failed` にする。失効させた件数を返す。
pub async fn expire_abandoned_sessions(state: &GatewayState, max_age: Duration) -> usize {
    let mut expired = 0;
    for session in state.sessions.evict_expired(max_age).await {
        match state.orchestrator.abandon(&session).await {
            Ok(true) => expired += 1,
            Ok(false) => {}
            Err(e) => tracing::error!(
                session_id = %session.id,
                document_id = %session.subject_id,
                error = %e,
                "放棄されたセッションを失効できません"
            ),
        }
    }
    expired
}

/// `interval` ごとに `expire_abandoned_sessions` を実行し続ける。
pub async fn sweep_abandoned_sessions(state: Arc<GatewayState>, max_age: Duration, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let expired = expire_abandoned_sessions(&state, max_age).await;
        if expired > 0 {
            tracing::info!(expired, "放棄されたセッションを失効");
        }
    }
}
