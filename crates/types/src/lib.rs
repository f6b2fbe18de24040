//! # QRSign 共有型定義
//!
//! 署名オーケストレーションで扱うデータ構造と、外部署名機関・Gateway間の
//! ワイヤフォーマットをRust構造体として提供する。
//!
//! ## エンコーディング規則
//! - Base64: バイナリデータ（ファイル本体、CMS署名、QR画像）
//! - 16進数（小文字）: SHA-256ダイジェスト
//! - UNIXタイムスタンプ（秒）: 作成・更新日時

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// 現在時刻のUNIXタイムスタンプ（秒）。
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// 署名者
// ---------------------------------------------------------------------------

/// 署名者の種別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerType {
    /// 個人
    Individual,
    /// 法人
    LegalEntity,
}

/// 署名者識別情報の検証エラー。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// IINが12桁の数字ではない
    #[error("IINは12桁の数字である必要があります")]
    InvalidIin,
    /// 法人のBINが12桁の数字ではない
    #[error("法人のBINは12桁の数字である必要があります")]
    InvalidBin,
    /// 法人の名称が空
    #[error("法人には会社名が必要です")]
    MissingCompanyName,
    /// 氏名が空
    #[error("氏名が空です")]
    MissingFullName,
}

/// 12桁の数字かどうか。
fn is_twelve_digits(value: &str) -> bool {
    value.len() == 12 && value.bytes().all(|b| b.is_ascii_digit())
}

/// 署名者識別情報。
///
/// 完了した署名に紐付いた後は変更されない。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerIdentity {
    /// 個人識別番号（IIN、12桁）
    pub iin: String,
    /// 氏名
    pub full_name: String,
    /// 署名者の種別
    pub signer_type: SignerType,
    /// 法人識別番号（BIN、法人のみ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<String>,
    /// 会社名（法人のみ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
}

impl SignerIdentity {
    /// 種別を指定して署名者を構築し、検証する。
    pub fn new(
        iin: &str,
        full_name: &str,
        signer_type: SignerType,
        bin: Option<&str>,
        company_name: Option<&str>,
    ) -> Result<Self, IdentityError> {
        let identity = Self {
            iin: iin.trim().to_string(),
            full_name: full_name.trim().to_string(),
            signer_type,
            bin: bin.map(|b| b.trim().to_string()),
            company_name: company_name.map(|c| c.trim().to_string()),
        };
        identity.validate()?;
        Ok(identity)
    }

    /// 個人の署名者を構築する。
    pub fn individual(iin: &str, full_name: &str) -> Result<Self, IdentityError> {
        Self::new(iin, full_name, SignerType::Individual, None, None)
    }

    /// 法人の署名者を構築する。
    pub fn legal_entity(
        iin: &str,
        full_name: &str,
        bin: &str,
        company_name: &str,
    ) -> Result<Self, IdentityError> {
        Self::new(
            iin,
            full_name,
            SignerType::LegalEntity,
            Some(bin),
            Some(company_name),
        )
    }

    /// IIN・BIN・会社名の形式を検証する。
    ///
    /// デシリアライズ経由で構築された値はこの検証を通していないため、
    /// 外部入力を受け取った箇所で呼び出すこと。
    pub fn validate(&self) -> Result<(), IdentityError> {
        if !is_twelve_digits(&self.iin) {
            return Err(IdentityError::InvalidIin);
        }
        if self.full_name.trim().is_empty() {
            return Err(IdentityError::MissingFullName);
        }
        if self.signer_type == SignerType::LegalEntity {
            match self.bin.as_deref() {
                Some(bin) if is_twelve_digits(bin) => {}
                _ => return Err(IdentityError::InvalidBin),
            }
            if self
                .company_name
                .as_deref()
                .map(|c| c.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(IdentityError::MissingCompanyName);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ドキュメント
// ---------------------------------------------------------------------------

/// ドキュメントの署名状態。
///
/// `Uploaded → Signing → Signed` または `Signing → Failed`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// アップロード済み・未署名
    Uploaded,
    /// 署名セッション進行中
    Signing,
    /// 署名済み
    Signed,
    /// 署名失敗（拒否・タイムアウト・通信断）
    Failed,
}

/// アップロードされたドキュメント。
///
/// コアはドキュメントを削除しない。状態はオーケストレータだけが変更する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// ドキュメントID
    pub id: String,
    /// タイトル
    pub title: String,
    /// 元のファイル名（アーカイブ内のエントリ名にも使う）
    pub filename: String,
    /// MIMEタイプ
    pub mime_type: String,
    /// ファイルサイズ（バイト）
    pub file_size: u64,
    /// 所有者ID
    pub owner_id: String,
    /// Blobストレージ上の参照
    pub blob_ref: String,
    /// アップロード時に計算したSHA-256ダイジェスト（16進数）
    pub digest: String,
    /// 署名状態
    pub status: DocumentStatus,
    /// 署名レコードのID（署名済みの場合）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_id: Option<String>,
    /// 進行中の署名セッションID。ドキュメントの所有権トークンを兼ねる。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_session: Option<String>,
    /// 失敗理由（Failedの場合）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// 署名セッションを確保した日時（UNIX秒、署名中のみ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_started_at: Option<u64>,
    /// 所属パッケージID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<String>,
    /// 署名機関に登録されたドキュメントID（署名機関側での検証に使う）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority_document_id: Option<String>,
    /// 署名済みコピーのBlob参照
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_copy_ref: Option<String>,
    /// 楽観的排他制御のバージョン。保存のたびにリポジトリが進める。
    pub version: u64,
    /// 作成日時（UNIX秒）
    pub created_at: u64,
    /// 更新日時（UNIX秒）
    pub updated_at: u64,
}

impl Document {
    /// 署名セッションを開始した状態にする。
    pub fn mark_signing(&mut self, session_id: &str) {
        let now = unix_now();
        self.status = DocumentStatus::Signing;
        self.active_session = Some(session_id.to_string());
        self.session_started_at = Some(now);
        self.failure_reason = None;
        self.updated_at = now;
    }

    /// 署名完了状態にする。
    pub fn mark_signed(&mut self, signature_id: &str) {
        self.status = DocumentStatus::Signed;
        self.signature_id = Some(signature_id.to_string());
        self.active_session = None;
        self.session_started_at = None;
        self.failure_reason = None;
        self.updated_at = unix_now();
    }

    /// 署名失敗状態にする。
    pub fn mark_failed(&mut self, reason: &str) {
        self.status = DocumentStatus::Failed;
        self.active_session = None;
        self.session_started_at = None;
        self.failure_reason = Some(reason.to_string());
        self.updated_at = unix_now();
    }

    /// 署名機関への登録結果を記録する。
    pub fn mark_registered(&mut self, authority_document_id: &str, signed_copy_ref: &str) {
        self.authority_document_id = Some(authority_document_id.to_string());
        self.signed_copy_ref = Some(signed_copy_ref.to_string());
        self.updated_at = unix_now();
    }

    /// 署名中のセッションが `ttl_secs` を過ぎて放置されているか。
    pub fn session_expired(&self, ttl_secs: u64, now: u64) -> bool {
        if self.status != DocumentStatus::Signing {
            return false;
        }
        let started = self.session_started_at.unwrap_or(self.updated_at);
        started.saturating_add(ttl_secs) <= now
    }

    /// 署名済みコピーのファイル名: `{stem}-sigex{authority_document_id}{.ext}`。
    pub fn signed_copy_filename(&self, authority_document_id: &str) -> String {
        match self.filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => {
                format!("{stem}-sigex{authority_document_id}.{ext}")
            }
            _ => format!("{}-sigex{authority_document_id}", self.filename),
        }
    }
}

// ---------------------------------------------------------------------------
// 署名
// ---------------------------------------------------------------------------

/// 署名レコード。署名に成功したドキュメントにつき1件だけ作成され、以後変更されない。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// 署名ID
    pub id: String,
    /// 署名対象ドキュメントID
    pub document_id: String,
    /// CMS署名（DER）のBlob参照
    pub blob_ref: String,
    /// 署名機関が証明した署名者
    pub signer: SignerIdentity,
    /// 作成日時（UNIX秒）
    pub created_at: u64,
}

// ---------------------------------------------------------------------------
// パッケージ
// ---------------------------------------------------------------------------

/// パッケージの集約状態。メンバーの状態から毎回導出する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    /// 署名未開始
    Draft,
    /// いずれかのメンバーが署名中
    Signing,
    /// 全メンバー署名済み
    Signed,
    /// 一部のメンバーのみ署名済み
    PartiallySigned,
    /// 署名済みメンバーなし、かつ失敗あり
    Failed,
}

impl PackageStatus {
    /// メンバーの状態から集約状態を導出する純粋関数。
    ///
    /// 1. 署名中のメンバーがあれば `Signing`
    /// 2. 全員署名済みなら `Signed`
    /// 3. 一部署名済みなら `PartiallySigned`
    /// 4. 署名済みなし・失敗ありなら `Failed`
    /// 5. それ以外（メンバーなしを含む）は `Draft`
    pub fn derive(members: &[DocumentStatus]) -> Self {
        let count = |s: DocumentStatus| members.iter().filter(|m| **m == s).count();
        let signing = count(DocumentStatus::Signing);
        let signed = count(DocumentStatus::Signed);
        let failed = count(DocumentStatus::Failed);

        if signing > 0 {
            PackageStatus::Signing
        } else if !members.is_empty() && signed == members.len() {
            PackageStatus::Signed
        } else if signed > 0 {
            PackageStatus::PartiallySigned
        } else if failed > 0 {
            PackageStatus::Failed
        } else {
            PackageStatus::Draft
        }
    }
}

/// 複数ドキュメントをまとめたパッケージ。
///
/// 状態は保持しない。`PackageStatus::derive` で都度導出する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// パッケージID
    pub id: String,
    /// タイトル
    pub title: String,
    /// 説明
    #[serde(default)]
    pub description: String,
    /// 所有者ID
    pub owner_id: String,
    /// メンバーのドキュメントID（挿入順がアーカイブの並び順になる）
    pub document_ids: Vec<String>,
    /// 楽観的排他制御のバージョン。保存のたびにリポジトリが進める。
    #[serde(default)]
    pub version: u64,
    /// 作成日時（UNIX秒）
    pub created_at: u64,
    /// 更新日時（UNIX秒）
    pub updated_at: u64,
}

impl Package {
    /// メンバーを末尾に追加する。既に含まれている場合は何もしない。
    pub fn add_document(&mut self, document_id: &str) -> bool {
        if self.document_ids.iter().any(|d| d == document_id) {
            return false;
        }
        self.document_ids.push(document_id.to_string());
        self.updated_at = unix_now();
        true
    }
}

// ---------------------------------------------------------------------------
// 署名セッション
// ---------------------------------------------------------------------------

/// セッションの対象種別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    /// 単体ドキュメント
    Document,
    /// パッケージのメンバー
    PackageMember,
}

/// 署名セッションの状態。前進のみ可能で、終端状態からは遷移しない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// 署名機関にセッションを登録済み
    Initiated,
    /// 完了待ちのポーリング中
    Polling,
    /// 署名取得済み
    Completed,
    /// 拒否・通信断で失敗
    Failed,
    /// ポーリング予算を使い切った
    Timeout,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::Initiated => 0,
            SessionState::Polling => 1,
            SessionState::Completed | SessionState::Failed | SessionState::Timeout => 2,
        }
    }

    /// 終端状態かどうか。
    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

/// 後退または終端状態からの遷移を試みた。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("セッション状態を {from:?} から {to:?} へ遷移できません")]
pub struct SessionTransitionError {
    /// 現在の状態
    pub from: SessionState,
    /// 要求された状態
    pub to: SessionState,
}

/// 1回の署名試行に対応するセッション。
///
/// `initiate` で作成され `complete` で消費される。永続化はしない。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningSession {
    /// セッションID（ドキュメントの所有権トークン）
    pub id: String,
    /// 対象種別
    pub subject_kind: SubjectKind,
    /// 対象ドキュメントID
    pub subject_id: String,
    /// パッケージメンバーの場合の所属パッケージID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<String>,
    /// 署名機関が割り当てたセッションID
    pub external_session_id: String,
    /// 署名対象データの送信先URL
    pub data_url: String,
    /// 署名完了をポーリングするURL
    pub sign_url: String,
    /// QRコード画像（不透明なバイト列）
    pub qr_image: Vec<u8>,
    /// 個人向けモバイルアプリの起動リンク
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_link: Option<String>,
    /// 法人向けモバイルアプリの起動リンク
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_link: Option<String>,
    /// 署名を要求した署名者
    pub signer: SignerIdentity,
    /// 署名対象ドキュメントのダイジェスト
    pub payload_digest: String,
    /// セッション状態
    pub state: SessionState,
    /// ポーリングの試行回数
    pub retry_count: u32,
}

impl SigningSession {
    /// 状態を前進させる。同一状態への遷移は許容する。
    pub fn advance(&mut self, to: SessionState) -> Result<(), SessionTransitionError> {
        let from = self.state;
        if from == to && !from.is_terminal() {
            return Ok(());
        }
        if from.is_terminal() || to.rank() <= from.rank() {
            return Err(SessionTransitionError { from, to });
        }
        self.state = to;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 署名機関ワイヤフォーマット
// ---------------------------------------------------------------------------

/// QR署名手続き登録リクエスト（`POST /api/egovQr`）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgovQrRequest {
    /// 署名アプリに表示される説明
    pub description: String,
}

/// QR署名手続き登録レスポンス。
///
/// 署名機関がエラーを返す場合は `message` のみが設定される。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EgovQrResponse {
    /// 署名機関が割り当てた手続きID（返されない場合もある）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Base64エンコードされたQRコード画像
    #[serde(rename = "qrCode", default)]
    pub qr_code: String,
    /// 署名対象データの送信先URL
    #[serde(rename = "dataURL", default)]
    pub data_url: String,
    /// 署名の取得URL
    #[serde(rename = "signURL", default)]
    pub sign_url: String,
    /// 個人向けアプリ起動リンク
    #[serde(
        rename = "eGovMobileLaunchLink",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub mobile_link: Option<String>,
    /// 法人向けアプリ起動リンク
    #[serde(
        rename = "eGovBusinessLaunchLink",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub business_link: Option<String>,
    /// エラーメッセージ
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 署名対象ドキュメントのメタデータ項目。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaEntry {
    /// 項目名
    pub name: String,
    /// 値
    pub value: String,
}

/// 署名対象ファイル。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePayload {
    /// PDFの場合 `"@file/pdf"`、それ以外は空文字列
    pub mime: String,
    /// Base64エンコードされたファイル本体（署名応答ではCMS署名）
    pub data: String,
}

/// `document` フィールドの中身。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentPayload {
    /// ファイル
    pub file: FilePayload,
}

/// 署名対象ドキュメント1件。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentToSign {
    /// 手続き内の通し番号（1始まり）
    pub id: u32,
    /// 表示名（ロシア語）
    #[serde(rename = "nameRu")]
    pub name_ru: String,
    /// 表示名（カザフ語）
    #[serde(rename = "nameKz")]
    pub name_kz: String,
    /// 表示名（英語）
    #[serde(rename = "nameEn")]
    pub name_en: String,
    /// 付帯メタデータ
    #[serde(default)]
    pub meta: Vec<MetaEntry>,
    /// ファイル
    pub document: DocumentPayload,
}

/// 署名対象データ送信リクエスト（`POST {dataURL}`）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSubmission {
    /// `"CMS_SIGN_ONLY"`（デタッチド署名）または `"CMS_WITH_DATA"`
    #[serde(rename = "signMethod")]
    pub sign_method: String,
    /// 署名対象ドキュメント
    #[serde(rename = "documentsToSign")]
    pub documents_to_sign: Vec<DocumentToSign>,
}

/// ドキュメント登録リクエスト（`POST /api`）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDocumentRequest {
    /// タイトル
    pub title: String,
    /// 説明
    pub description: String,
    /// 署名形式（`"cms"`）
    #[serde(rename = "signType")]
    pub sign_type: String,
    /// Base64エンコードされたCMS署名
    pub signature: String,
}

/// ドキュメント登録・データ送信・検証のレスポンス。
///
/// 失敗時は `documentId` がなく `message` だけが設定される。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisteredDocumentResponse {
    /// 署名機関が割り当てたドキュメントID
    #[serde(
        rename = "documentId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub document_id: Option<String>,
    /// エラーメッセージ
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 署名取得レスポンス（`GET {signURL}`）。
///
/// 署名がまだの場合や取消時は `message` のみが設定される。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignPollResponse {
    /// 状態メッセージ
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 署名済みドキュメント（`document.file.data` がCMS署名）
    #[serde(rename = "documentsToSign", default)]
    pub documents_to_sign: Vec<DocumentToSign>,
}

// ---------------------------------------------------------------------------
// Gateway API
// ---------------------------------------------------------------------------

/// 署名開始レスポンス。クライアントはQRを表示し、直ちに完了APIを呼び出す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    /// セッションID
    pub session_id: String,
    /// 対象ドキュメントID
    pub document_id: String,
    /// Base64エンコードされたQRコード画像
    pub qr_code_base64: String,
    /// 個人向けアプリ起動リンク
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_link: Option<String>,
    /// 法人向けアプリ起動リンク
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_link: Option<String>,
}

/// 署名完了リクエスト。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    /// 署名開始時に返されたセッションID
    pub session_id: String,
}

/// パッケージ署名完了リクエスト。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletePackageRequest {
    /// 署名開始時に返されたセッションID（メンバー順）
    pub session_ids: Vec<String>,
}

/// パッケージ作成リクエスト。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePackageRequest {
    /// タイトル
    pub title: String,
    /// 説明
    #[serde(default)]
    pub description: String,
}

/// 検証結果レスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    /// ドキュメントID
    pub document_id: String,
    /// ファイルと署名が一致し、署名機関も否定していない
    pub verified: bool,
    /// `valid` / `checksum_mismatch` / `malformed_signature` / `not_signed`
    pub outcome: String,
    /// 詳細（不一致・不正の理由）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// 署名機関側の検証結果（未登録・到達不能の場合はなし）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority_verified: Option<bool>,
}
