//! # QRSign Gateway
//!
//! QR署名オーケストレーションのHTTP API。
//!
//! ## 役割
//! - ドキュメントのアップロードとファイルストレージへの保存
//! - 署名機関（SIGEX eGov QR）とのセッション開始・完了待ち
//! - パッケージ（複数ドキュメント）の署名と署名済みアーカイブの配布
//! - 保存ファイルと署名の完全性検証
//!
//! ## API エンドポイント
//! - `POST /documents`, `GET /documents`, `GET /documents/{id}`
//! - `POST /documents/{id}/sign`, `POST /documents/{id}/sign/complete`
//! - `GET /documents/{id}/verify`, `GET /documents/{id}/file`, `GET /documents/{id}/signature`
//! - `GET /documents/{id}/signed`
//! - `POST /packages`, `GET /packages`, `GET /packages/{id}`
//! - `POST /packages/{id}/documents/{document_id}`
//! - `POST /packages/{id}/sign`, `POST /packages/{id}/sign/complete`
//! - `GET /packages/{id}/archive`

mod config;
mod endpoints;
mod error;
mod sessions;
mod storage;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use qrsign_core::{BlobStorage, InMemoryRepository};
use qrsign_sigex::SigexClient;

use config::{GatewayConfig, GatewayState, StorageBackend};
use endpoints::*;
use storage::LocalBlobStorage;

/// 放棄されたセッションを探す間隔。
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// ルーティングを組み立てる。
fn router(state: Arc<GatewayState>) -> axum::Router {
    let body_limit = usize::try_from(state.max_upload_size)
        .unwrap_or(usize::MAX)
        .saturating_add(1);

    axum::Router::new()
        .route("/documents", post(handle_upload).get(handle_list_documents))
        .route("/documents/{id}", get(handle_get_document))
        .route("/documents/{id}/sign", post(handle_sign_document))
        .route("/documents/{id}/sign/complete", post(handle_complete_document))
        .route("/documents/{id}/verify", get(handle_verify))
        .route("/documents/{id}/file", get(handle_download_document))
        .route("/documents/{id}/signature", get(handle_download_signature))
        .route("/documents/{id}/signed", get(handle_download_signed_copy))
        .route("/packages", post(handle_create_package).get(handle_list_packages))
        .route("/packages/{id}", get(handle_get_package))
        .route(
            "/packages/{id}/documents/{document_id}",
            post(handle_add_document),
        )
        .route("/packages/{id}/sign", post(handle_sign_package))
        .route("/packages/{id}/sign/complete", post(handle_complete_package))
        .route("/packages/{id}/archive", get(handle_download_archive))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// 設定に従ってファイルストレージを構築する。
fn build_storage(config: &GatewayConfig) -> anyhow::Result<Arc<dyn BlobStorage>> {
    match config.storage_backend {
        StorageBackend::Local => {
            tracing::info!(media_root = %config.media_root.display(), "ローカルストレージを使用");
            Ok(Arc::new(LocalBlobStorage::new(&config.media_root)))
        }
        #[cfg(feature = "vendor-aws")]
        StorageBackend::S3 => Ok(Arc::new(storage::S3BlobStorage::from_env()?)),
        #[cfg(not(feature = "vendor-aws"))]
        StorageBackend::S3 => {
            anyhow::bail!("FILE_STORAGE_BACKEND=s3 には vendor-aws feature が必要です")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = GatewayConfig::from_env()?;
    let storage = build_storage(&config)?;
    let authority = SigexClient::new(&config.sigex_base_url, config.sigex_timeout)?;
    tracing::info!(
        sigex_base_url = %authority.base_url(),
        poll_retries = config.orchestrator.poll.max_retries,
        poll_interval_secs = config.orchestrator.poll.interval.as_secs(),
        deadline_secs = config.orchestrator.poll.deadline.as_secs(),
        session_ttl_secs = config.orchestrator.poll.session_ttl.as_secs(),
        package_concurrency = config.orchestrator.package_concurrency,
        "署名機関を設定"
    );

    let state = Arc::new(GatewayState::new(
        Arc::new(InMemoryRepository::new()),
        storage,
        Arc::new(authority),
        config.orchestrator.clone(),
        config.max_upload_size,
    ));

    let session_ttl = config.orchestrator.poll.session_ttl;
    tokio::spawn(sweep_abandoned_sessions(
        state.clone(),
        session_ttl,
        SESSION_SWEEP_INTERVAL.min(session_ttl.max(Duration::from_secs(1))),
    ));

    tracing::info!("Gatewayを {} で起動します", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}

#[cfg(test)]
mod tests;
