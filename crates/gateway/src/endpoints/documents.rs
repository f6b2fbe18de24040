//! # ドキュメントAPI
//!
//! - `POST /documents?filename=&title=[&package_id=]` — 生ボディのアップロード
//! - `GET /documents`, `GET /documents/{id}`
//! - `GET /documents/{id}/verify`
//! - `GET /documents/{id}/file`, `GET /documents/{id}/signature`

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use qrsign_core::{DocumentView, UploadRequest};
use qrsign_types::{Document, VerifyResponse};
use serde::Deserialize;

use super::{attachment, Owner};
use crate::config::GatewayState;
use crate::error::GatewayError;

/// CMS署名ファイルのMIMEタイプ。
const CMS_MIME_TYPE: &str = "application/pkcs7-signature";

/// アップロードのクエリパラメータ。
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    /// ファイル名
    pub filename: String,
    /// タイトル
    #[serde(default)]
    pub title: Option<String>,
    /// 追加先パッケージ
    #[serde(default)]
    pub package_id: Option<String>,
}

/// POST /documents — ドキュメントのアップロード。
///
/// `Content-Type` が `application/octet-stream` 以外なら申告MIMEタイプとして検証に使う。
pub async fn handle_upload(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Document>), GatewayError> {
    if body.len() as u64 > state.max_upload_size {
        return Err(GatewayError::PayloadTooLarge(state.max_upload_size));
    }
    let mime_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().trim().to_string())
        .filter(|v| !v.is_empty() && v != "application/octet-stream");

    let document = state
        .documents
        .upload_document(UploadRequest {
            owner_id: owner,
            filename: query.filename,
            title: query.title.unwrap_or_default(),
            mime_type,
            data: body.to_vec(),
            package_id: query.package_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(document)))
}

/// GET /documents — 所有者のドキュメント一覧。
pub async fn handle_list_documents(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
) -> Result<Json<Vec<Document>>, GatewayError> {
    Ok(Json(state.documents.list_documents(&owner).await?))
}

/// GET /documents/{id} — 状態と署名。
pub async fn handle_get_document(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
    Path(document_id): Path<String>,
) -> Result<Json<DocumentView>, GatewayError> {
    Ok(Json(state.documents.document_status(&document_id, &owner).await?))
}

/// GET /documents/{id}/verify — 完全性の検証。
pub async fn handle_verify(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
    Path(document_id): Path<String>,
) -> Result<Json<VerifyResponse>, GatewayError> {
    let report = state
        .verification
        .verify_document(&document_id, &owner)
        .await?;
    Ok(Json(VerifyResponse {
        document_id,
        verified: report.verified(),
        outcome: report.outcome.kind().to_string(),
        detail: report.outcome.detail(),
        authority_verified: report.authority_verified,
    }))
}

/// GET /documents/{id}/file — 原本のダウンロード。
pub async fn handle_download_document(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
    Path(document_id): Path<String>,
) -> Result<Response, GatewayError> {
    let (data, filename, mime_type) = state
        .documents
        .download_document(&document_id, &owner)
        .await?;
    attachment(data, &filename, &mime_type)
}

/// GET /documents/{id}/signed — 署名機関に登録した署名済みコピーのダウンロード。
pub async fn handle_download_signed_copy(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
    Path(document_id): Path<String>,
) -> Result<Response, GatewayError> {
    let (data, filename, mime_type) = state
        .documents
        .download_signed_copy(&document_id, &owner)
        .await?;
    attachment(data, &filename, &mime_type)
}

/// GET /documents/{id}/signature — CMS署名のダウンロード。
pub async fn handle_download_signature(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
    Path(document_id): Path<String>,
) -> Result<Response, GatewayError> {
    let (data, filename) = state
        .documents
        .download_signature(&document_id, &owner)
        .await?;
    attachment(data, &filename, CMS_MIME_TYPE)
}
