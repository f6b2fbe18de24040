//! # Gateway エラー型
//!
//! ユースケースの `SigningError` をHTTPステータスに対応付ける。

use axum::http::StatusCode;
use qrsign_core::SigningError;

/// Gatewayエラー型。
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// 対象が存在しない
    #[error("見つかりません: {0}")]
    NotFound(String),
    /// 所有者ヘッダがない
    #[error("認証されていません: {0}")]
    Unauthorized(String),
    /// 他の所有者のリソース
    #[error("アクセスが拒否されました: {0}")]
    Forbidden(String),
    /// 状態の競合（署名セッション進行中・署名済み等）
    #[error("競合しています: {0}")]
    Conflict(String),
    /// 不正なリクエスト
    #[error("不正なリクエスト: {0}")]
    BadRequest(String),
    /// アップロードサイズ超過
    #[error("ファイルサイズが上限 {0} バイトを超えています")]
    PayloadTooLarge(u64),
    /// 署名機関との通信失敗、または署名機関による拒否
    #[error("署名機関エラー: {0}")]
    Authority(String),
    /// 署名待ちのタイムアウト
    #[error("{0}")]
    Timeout(String),
    /// ストレージ操作に失敗
    #[error("ストレージ操作に失敗: {0}")]
    Storage(String),
    /// 内部エラー
    #[error("内部エラー: {0}")]
    Internal(String),
}

impl From<SigningError> for GatewayError {
    fn from(e: SigningError) -> Self {
        match e {
            SigningError::NotFound(what) => GatewayError::NotFound(what),
            SigningError::AccessDenied(what) => GatewayError::Forbidden(what),
            SigningError::SessionAlreadyActive(_) | SigningError::InvalidState(_) => {
                GatewayError::Conflict(e.to_string())
            }
            SigningError::InvalidDocument(_) | SigningError::InvalidIdentity(_) => {
                GatewayError::BadRequest(e.to_string())
            }
            SigningError::AuthorityUnreachable(_) | SigningError::AuthorityRejected(_) => {
                GatewayError::Authority(e.to_string())
            }
            SigningError::Timeout { .. } => GatewayError::Timeout(e.to_string()),
            SigningError::StorageUnavailable(msg) => GatewayError::Storage(msg),
            SigningError::Cancelled => GatewayError::Internal(e.to_string()),
        }
    }
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Authority(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "リクエスト処理に失敗");
        }
        (status, self.to_string()).into_response()
    }
}
