//! # Core エラー型
//!
//! ポート（リポジトリ・Blobストレージ・署名機関）ごとのエラーと、
//! ユースケースが呼び出し側へ返す `SigningError`。

use qrsign_types::{IdentityError, SessionTransitionError};

/// リポジトリポートのエラー。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    /// レコードが存在しない
    #[error("見つかりません: {0}")]
    NotFound(String),
    /// バックエンドに到達できない
    #[error("リポジトリが利用できません: {0}")]
    StorageUnavailable(String),
    /// 楽観的排他制御の競合、または一意制約違反
    #[error("更新が競合しました: {0}")]
    Conflict(String),
}

/// Blobストレージポートのエラー。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Blobが存在しない
    #[error("ファイルが見つかりません: {0}")]
    NotFound(String),
    /// キーが不正（パストラバーサル等）
    #[error("不正なストレージキー: {0}")]
    InvalidKey(String),
    /// 読み書きに失敗
    #[error("ストレージが利用できません: {0}")]
    Unavailable(String),
}

/// 署名機関トランスポートのエラー。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorityError {
    /// 通信エラー（接続失敗・タイムアウト・5xx）
    #[error("署名機関に接続できません: {0}")]
    Unreachable(String),
    /// 署名機関がリクエストを拒否した、または署名者が取り消した
    #[error("署名機関が拒否しました: {0}")]
    Rejected(String),
}

/// 署名ユースケースのエラー型。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    /// ドキュメント・パッケージ・署名が存在しない
    #[error("見つかりません: {0}")]
    NotFound(String),
    /// リポジトリまたはBlobストレージが利用できない
    #[error("ストレージが利用できません: {0}")]
    StorageUnavailable(String),
    /// 署名機関に到達できない
    #[error("署名機関に接続できません: {0}")]
    AuthorityUnreachable(String),
    /// 署名機関が拒否した
    #[error("署名機関が拒否しました: {0}")]
    AuthorityRejected(String),
    /// ポーリング予算または期限を使い切った
    #[error("署名待ちがタイムアウトしました（{attempts}回試行）")]
    Timeout {
        /// 試行回数
        attempts: u32,
        /// 最後に観測した通信エラー
        last_error: Option<String>,
    },
    /// 呼び出し側がキャンセルした
    #[error("署名がキャンセルされました")]
    Cancelled,
    /// ドキュメントは既に署名中
    #[error("ドキュメント {0} は既に署名セッションを持っています")]
    SessionAlreadyActive(String),
    /// 現在の状態では実行できない操作
    #[error("不正な状態です: {0}")]
    InvalidState(String),
    /// 受け付けられないドキュメント（空・サイズ超過・形式外）
    #[error("不正なドキュメント: {0}")]
    InvalidDocument(String),
    /// 所有者以外からのアクセス
    #[error("アクセスが拒否されました: {0}")]
    AccessDenied(String),
    /// 署名者識別情報が不正
    #[error("署名者情報が不正です: {0}")]
    InvalidIdentity(#[from] IdentityError),
}

impl SigningError {
    /// ドキュメントの `failure_reason` に記録する短い理由。
    pub fn failure_reason(&self) -> String {
        match self {
            SigningError::Timeout { .. } => "timeout".to_string(),
            SigningError::Cancelled => "cancelled".to_string(),
            SigningError::AuthorityRejected(msg) => format!("rejected: {msg}"),
            SigningError::AuthorityUnreachable(msg) => format!("unreachable: {msg}"),
            other => other.to_string(),
        }
    }
}

impl From<RepositoryError> for SigningError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(id) => SigningError::NotFound(id),
            RepositoryError::StorageUnavailable(msg) => SigningError::StorageUnavailable(msg),
            RepositoryError::Conflict(msg) => SigningError::InvalidState(msg),
        }
    }
}

impl From<StorageError> for SigningError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => SigningError::NotFound(key),
            StorageError::InvalidKey(key) => SigningError::InvalidDocument(key),
            StorageError::Unavailable(msg) => SigningError::StorageUnavailable(msg),
        }
    }
}

impl From<AuthorityError> for SigningError {
    fn from(e: AuthorityError) -> Self {
        match e {
            AuthorityError::Unreachable(msg) => SigningError::AuthorityUnreachable(msg),
            AuthorityError::Rejected(msg) => SigningError::AuthorityRejected(msg),
        }
    }
}

impl From<SessionTransitionError> for SigningError {
    fn from(e: SessionTransitionError) -> Self {
        SigningError::InvalidState(e.to_string())
    }
}
