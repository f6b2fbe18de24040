//! # Gatewayエンドポイント
//!
//! 所有者は `x-owner-id` ヘッダで受け取る。認証は前段の責務。

pub mod documents;
pub mod packages;
pub mod signing;

pub use documents::{
    handle_download_document, handle_download_signature, handle_download_signed_copy,
    handle_get_document, handle_list_documents, handle_upload, handle_verify,
};
pub use packages::{
    handle_add_document, handle_create_package, handle_download_archive, handle_get_package,
    handle_list_packages,
};
pub use signing::{
    expire_abandoned_sessions, handle_complete_document, handle_complete_package,
    handle_sign_document, handle_sign_package, sweep_abandoned_sessions,
};

use axum::extract::FromRequestParts;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};

use crate::error::GatewayError;

/// 所有者IDのヘッダ名。
pub const OWNER_HEADER: &str = "x-owner-id";

/// リクエストの所有者。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Owner(v.to_string()))
            .ok_or_else(|| GatewayError::Unauthorized(format!("{OWNER_HEADER} ヘッダがありません")))
    }
}

/// `Content-Disposition` に入れられる形にファイル名を整える。
fn header_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// ダウンロード用のレスポンスを作る。
pub(crate) fn attachment(data: Vec<u8>, filename: &str, content_type: &str) -> Result<Response, GatewayError> {
    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        header_filename(filename)
    ))
    .map_err(|e| GatewayError::Internal(format!("Content-Dispositionの生成に失敗: {e}")))?;
    let content_type = HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));

    Ok(([(CONTENT_TYPE, content_type), (CONTENT_DISPOSITION, disposition)], data).into_response())
}
