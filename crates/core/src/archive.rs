//! # パッケージアーカイブ
//!
//! 署名済みメンバーの原本と署名をZIPにまとめる。
//!
//! ## レイアウト
//! ```text
//! originals/<filename>
//! signatures/<filename>.cms
//! ```
//! - メンバーの挿入順に、`Signed` のドキュメントだけを含める
//! - 同じファイル名が複数ある場合は、メンバー位置（1始まり）を `{n}_` として前置する
//! - 前置した名前が他のエントリと衝突する場合は、衝突しなくなるまで前置を繰り返す
//! - タイムスタンプと権限は固定値。同じ入力からは同じバイト列が得られる

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Write};
use std::sync::Arc;

use qrsign_types::{Document, DocumentStatus, Package};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::SigningError;
use crate::orchestrator::{ensure_owner, load_members};
use crate::ports::{BlobStorage, Repository};

/// 原本を格納するディレクトリ。
pub const ORIGINALS_DIR: &str = "originals";

/// 署名を格納するディレクトリ。
pub const SIGNATURES_DIR: &str = "signatures";

/// 署名ファイルの拡張子。
pub const SIGNATURE_SUFFIX: &str = ".cms";

/// アーカイブに含める1メンバー分のデータ。
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    /// パッケージ内の位置（1始まり）
    pub position: usize,
    /// 元のファイル名
    pub filename: String,
    /// 原本
    pub original: Vec<u8>,
    /// CMS署名（DER）
    pub signature: Vec<u8>,
}

/// パッケージアーカイブの組み立て。
pub struct PackageArchiveBuilder {
    repo: Arc<dyn Repository>,
    storage: Arc<dyn BlobStorage>,
}

impl PackageArchiveBuilder {
    /// ポートから構築する。
    pub fn new(repo: Arc<dyn Repository>, storage: Arc<dyn BlobStorage>) -> Self {
        Self { repo, storage }
    }

    /// 所有者を確認してアーカイブを作り、ダウンロード用のファイル名と共に返す。
    pub async fn build_for_owner(
        &self,
        package_id: &str,
        owner_id: &str,
    ) -> Result<(Vec<u8>, String), SigningError> {
        let package = self.repo.load_package(package_id).await?;
        ensure_owner(&package.owner_id, owner_id, package_id)?;
        let archive = self.build(&package).await?;
        Ok((archive, format!("package_{package_id}_signed.zip")))
    }

    /// パッケージのアーカイブを作る。
    pub async fn build(&self, package: &Package) -> Result<Vec<u8>, SigningError> {
        let documents = load_members(self.repo.as_ref(), package).await?;

        let mut members = Vec::new();
        for (index, document) in documents.iter().enumerate() {
            if document.status != DocumentStatus::Signed {
                continue;
            }
            if let Some(member) = self.collect(index + 1, document).await? {
                members.push(member);
            }
        }

        let archive = write_archive(&members)?;
        tracing::info!(
            package_id = %package.id,
            members = package.document_ids.len(),
            included = members.len(),
            bytes = archive.len(),
            "パッケージアーカイブを作成"
        );
        Ok(archive)
    }

    async fn collect(
        &self,
        position: usize,
        document: &Document,
    ) -> Result<Option<ArchiveMember>, SigningError> {
        let Some(signature) = self.repo.signature_for_document(&document.id).await? else {
            tracing::warn!(
                document_id = %document.id,
                "署名済みですが署名レコードがありません"
            );
            return Ok(None);
        };
        Ok(Some(ArchiveMember {
            position,
            filename: document.filename.clone(),
            original: self.storage.read_file(&document.blob_ref).await?,
            signature: self.storage.read_file(&signature.blob_ref).await?,
        }))
    }
}

/// パス区切りを取り除いたファイル名。
fn base_name(filename: &str) -> &str {
    filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("document")
}

/// 各メンバーのエントリ名を決める。重複する名前には位置を前置する。
///
/// 返す名前はすべて互いに異なる。一意な名前はそのまま使い、先に予約する。
pub fn entry_names(members: &[ArchiveMember]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for member in members {
        *counts.entry(base_name(&member.filename)).or_default() += 1;
    }

    let mut used: HashSet<String> = members
        .iter()
        .map(|member| base_name(&member.filename))
        .filter(|name| counts[name] == 1)
        .map(str::to_string)
        .collect();

    members
        .iter()
        .map(|member| {
            let name = base_name(&member.filename);
            if counts[name] == 1 {
                return name.to_string();
            }
            let prefix = format!("{}_", member.position);
            let mut candidate = format!("{prefix}{name}");
            while used.contains(&candidate) {
                candidate.insert_str(0, &prefix);
            }
            used.insert(candidate.clone());
            candidate
        })
        .collect()
}

/// メンバーから決定的なZIPを書き出す。
pub fn write_archive(members: &[ArchiveMember]) -> Result<Vec<u8>, SigningError> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let names = entry_names(members);

    for (member, name) in members.iter().zip(&names) {
        writer
            .start_file(format!("{ORIGINALS_DIR}/{name}"), options)
            .map_err(archive_error)?;
        writer.write_all(&member.original).map_err(archive_error)?;
    }
    for (member, name) in members.iter().zip(&names) {
        writer
            .start_file(format!("{SIGNATURES_DIR}/{name}{SIGNATURE_SUFFIX}"), options)
            .map_err(archive_error)?;
        writer.write_all(&member.signature).map_err(archive_error)?;
    }

    let cursor = writer.finish().map_err(archive_error)?;
    Ok(cursor.into_inner())
}

fn archive_error(e: impl std::fmt::Display) -> SigningError {
    SigningError::StorageUnavailable(format!("アーカイブの書き込みに失敗: {e}"))
}
