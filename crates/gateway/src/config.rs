//! # Gateway設定・共有状態
//!
//! 環境変数からの設定読み込みとGatewayの共有状態の定義。

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use qrsign_core::{
    BlobStorage, DocumentService, OrchestratorConfig, PollPolicy, Repository, SigningAuthority,
    SigningOrchestrator, VerificationService, DEFAULT_MAX_UPLOAD_SIZE, DEFAULT_PACKAGE_CONCURRENCY,
    DEFAULT_POLL_INTERVAL_SECS, DEFAULT_POLL_RETRIES,
};

use crate::sessions::SessionTable;

/// ファイルストレージの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// ローカルディスク（`MEDIA_ROOT`）
    Local,
    /// S3互換ストレージ
    S3,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageBackend::Local),
            "s3" => Ok(StorageBackend::S3),
            other => anyhow::bail!("FILE_STORAGE_BACKEND は local か s3 です: {other}"),
        }
    }
}

/// 環境変数から読み込む設定。
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// 待ち受けアドレス
    pub bind_addr: String,
    /// 署名機関のベースURL
    pub sigex_base_url: String,
    /// 署名機関へのHTTPリクエストごとのタイムアウト
    pub sigex_timeout: Duration,
    /// オーケストレータ設定
    pub orchestrator: OrchestratorConfig,
    /// ファイルストレージの種類
    pub storage_backend: StorageBackend,
    /// ローカルストレージのルート
    pub media_root: PathBuf,
    /// アップロード上限（バイト）
    pub max_upload_size: u64,
}

/// 環境変数を読み、未設定なら既定値を使う。
fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("環境変数 {name} が不正です ({raw}): {e}")),
        Err(_) => Ok(default),
    }
}

impl GatewayConfig {
    /// 環境変数から設定を読み込む。
    pub fn from_env() -> anyhow::Result<Self> {
        let retries: u32 = env_or("SIGEX_QR_POLL_RETRIES", DEFAULT_POLL_RETRIES)?;
        let interval: u64 = env_or("SIGEX_QR_POLL_INTERVAL", DEFAULT_POLL_INTERVAL_SECS)?;
        let mut poll = PollPolicy::new(retries, Duration::from_secs(interval));
        if let Ok(raw) = std::env::var("SIGNING_DEADLINE") {
            let secs: u64 = raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("環境変数 SIGNING_DEADLINE が不正です ({raw}): {e}"))?;
            poll = poll.with_deadline(Duration::from_secs(secs));
        }

        let package_concurrency: usize =
            env_or("PACKAGE_CONCURRENCY", DEFAULT_PACKAGE_CONCURRENCY)?;
        if package_concurrency == 0 {
            anyhow::bail!("PACKAGE_CONCURRENCY は1以上である必要があります");
        }

        Ok(Self {
            bind_addr: std::env::var("GATEWAY_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            sigex_base_url: std::env::var("SIGEX_BASE_URL")
                .unwrap_or_else(|_| qrsign_sigex::DEFAULT_BASE_URL.to_string()),
            sigex_timeout: Duration::from_secs(env_or("SIGEX_TIMEOUT", 30u64)?),
            orchestrator: OrchestratorConfig {
                poll,
                package_concurrency,
            },
            storage_backend: env_or("FILE_STORAGE_BACKEND", StorageBackend::Local)?,
            media_root: std::env::var("MEDIA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./media")),
            max_upload_size: env_or("MAX_UPLOAD_SIZE", DEFAULT_MAX_UPLOAD_SIZE)?,
        })
    }
}

/// Gatewayの共有状態。
pub struct GatewayState {
    /// 署名オーケストレータ（完了処理は別タスクで動くため `Arc`）
    pub orchestrator: Arc<SigningOrchestrator>,
    /// アップロード・一覧・ダウンロード
    pub documents: DocumentService,
    /// 検証
    pub verification: VerificationService,
    /// 開始から完了までの署名セッション
    pub sessions: SessionTable,
    /// アップロード上限（バイト）
    pub max_upload_size: u64,
}

impl GatewayState {
    /// ポートと設定から構築する。
    pub fn new(
        repo: Arc<dyn Repository>,
        storage: Arc<dyn BlobStorage>,
        authority: Arc<dyn SigningAuthority>,
        config: OrchestratorConfig,
        max_upload_size: u64,
    ) -> Self {
        let orchestrator = Arc::new(SigningOrchestrator::new(
            repo.clone(),
            storage.clone(),
            authority,
            config,
        ));
        let verification =
            VerificationService::new(repo.clone(), storage.clone(), orchestrator.client().clone());
        Self {
            orchestrator,
            documents: DocumentService::new(repo, storage, max_upload_size),
            verification,
            sessions: SessionTable::default(),
            max_upload_size,
        }
    }
}
