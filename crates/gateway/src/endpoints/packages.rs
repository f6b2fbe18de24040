//! # パッケージAPI
//!
//! - `POST /packages`, `GET /packages`, `GET /packages/{id}`
//! - `POST /packages/{id}/documents/{document_id}`
//! - `GET /packages/{id}/archive`

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use qrsign_core::{PackageReport, PackageSummary};
use qrsign_types::{CreatePackageRequest, Package};

use super::{attachment, Owner};
use crate::config::GatewayState;
use crate::error::GatewayError;

/// POST /packages — 空のパッケージを作る。
pub async fn handle_create_package(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
    Json(body): Json<CreatePackageRequest>,
) -> Result<(StatusCode, Json<Package>), GatewayError> {
    let package = state
        .documents
        .create_package(&owner, &body.title, &body.description)
        .await?;
    Ok((StatusCode::CREATED, Json(package)))
}

/// GET /packages — 所有者のパッケージ一覧（導出状態とメンバー数）。
pub async fn handle_list_packages(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
) -> Result<Json<Vec<PackageSummary>>, GatewayError> {
    Ok(Json(state.documents.list_packages(&owner).await?))
}

/// GET /packages/{id} — パッケージとメンバーの状態。
pub async fn handle_get_package(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
    Path(package_id): Path<String>,
) -> Result<Json<PackageReport>, GatewayError> {
    Ok(Json(state.documents.package_status(&package_id, &owner).await?))
}

/// POST /packages/{id}/documents/{document_id} — メンバーを追加する。
pub async fn handle_add_document(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
    Path((package_id, document_id)): Path<(String, String)>,
) -> Result<Json<Package>, GatewayError> {
    Ok(Json(
        state
            .documents
            .add_document_to_package(&package_id, &document_id, &owner)
            .await?,
    ))
}

/// GET /packages/{id}/archive — 署名済みメンバーのZIP。
pub async fn handle_download_archive(
    State(state): State<Arc<GatewayState>>,
    Owner(owner): Owner,
    Path(package_id): Path<String>,
) -> Result<Response, GatewayError> {
    let (archive, filename) = state
        .documents
        .download_package(&package_id, &owner)
        .await?;
    attachment(archive, &filename, "application/zip")
}
