//! # SIGEX eGov QR トランスポート
//!
//! `SigningAuthority` のHTTP実装。1メソッド1往復で、再試行と待機は
//! `qrsign_core::ExternalSigningClient` に任せる。
//!
//! ## エンドポイント
//! | 操作 | リクエスト |
//! |------|-----------|
//! | セッション登録 | `POST {base}/api/egovQr` |
//! | データ送信 | `POST {dataURL}`（署名者がQRを読むまでブロックする） |
//! | 署名取得 | `GET {signURL}` |
//! | ドキュメント登録 | `POST {base}/api`（CMS署名付き） |
//! | 原本送信 | `POST {base}/api/{id}/data`（`application/octet-stream`） |
//! | 検証 | `POST {base}/api/{id}/verify`（`application/octet-stream`） |
//!
//! 応答ボディに `message` だけが入っている場合は、登録・送信では拒否、
//! 取得では取消文言を含めば拒否、それ以外は署名待ちを意味する。
//! 検証で `message` が返った場合は、署名が原本と一致しないことを意味する。

use std::time::Duration;

use base64::Engine;
use qrsign_core::{AuthorityError, AuthorityPoll, AuthoritySession, SigningAuthority, SigningPayload};
use qrsign_types::{
    DataSubmission, DocumentPayload, DocumentToSign, EgovQrRequest, EgovQrResponse, FilePayload,
    RegisterDocumentRequest, RegisteredDocumentResponse, SignPollResponse,
};

/// 既定の接続先。
pub const DEFAULT_BASE_URL: &str = "https://sigex.kz";

/// デタッチドCMS署名を要求する署名方式。
pub const SIGN_METHOD_DETACHED: &str = "CMS_SIGN_ONLY";

/// 登録時の署名形式。
pub const SIGN_TYPE_CMS: &str = "cms";

const OCTET_STREAM: &str = "application/octet-stream";

/// SIGEXトランスポートのエラー型
#[derive(Debug, thiserror::Error)]
pub enum SigexError {
    /// 接続・送受信の失敗
    #[error("HTTP通信に失敗: {0}")]
    Http(String),
    /// 2xx以外のステータス
    #[error("HTTP {status}: {body}")]
    Status {
        /// ステータスコード
        status: u16,
        /// レスポンスボディ（先頭のみ）
        body: String,
    },
    /// レスポンスを解釈できない
    #[error("レスポンスの解析に失敗: {0}")]
    Decode(String),
    /// 署名機関が `message` で応答した
    #[error("{0}")]
    Message(String),
}

impl From<reqwest::Error> for SigexError {
    fn from(e: reqwest::Error) -> Self {
        SigexError::Http(e.to_string())
    }
}

impl From<SigexError> for AuthorityError {
    fn from(e: SigexError) -> Self {
        match e {
            SigexError::Message(msg) => AuthorityError::Rejected(msg),
            SigexError::Status { status, body }
                if (400..500).contains(&status) && status != 408 && status != 429 =>
            {
                AuthorityError::Rejected(format!("HTTP {status}: {body}"))
            }
            other => AuthorityError::Unreachable(other.to_string()),
        }
    }
}

/// 取消を意味する `message` かどうか。
fn is_cancellation(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("cancel") || lower.contains("отмен")
}

/// 署名アプリ向けの `mime` 値。PDFだけ専用の表記がある。
fn file_mime(mime_type: &str) -> &'static str {
    if mime_type.eq_ignore_ascii_case("application/pdf") {
        "@file/pdf"
    } else {
        ""
    }
}

/// データ送信のリクエストボディを組み立てる。
pub fn data_submission(payload: &SigningPayload) -> DataSubmission {
    let name = if payload.name.trim().is_empty() {
        payload.filename.clone()
    } else {
        payload.name.clone()
    };
    DataSubmission {
        sign_method: SIGN_METHOD_DETACHED.to_string(),
        documents_to_sign: vec![DocumentToSign {
            id: 1,
            name_ru: name.clone(),
            name_kz: name.clone(),
            name_en: name,
            meta: Vec::new(),
            document: DocumentPayload {
                file: FilePayload {
                    mime: file_mime(&payload.mime_type).to_string(),
                    data: qrsign_crypto::b64().encode(&payload.data),
                },
            },
        }],
    }
}

/// 登録系レスポンスから署名機関のドキュメントIDを取り出す。
fn registered_id(response: RegisteredDocumentResponse) -> Result<String, SigexError> {
    match (response.document_id, response.message) {
        (Some(id), _) => Ok(id),
        (None, Some(message)) => Err(SigexError::Message(message)),
        (None, None) => Err(SigexError::Decode("documentId がありません".to_string())),
    }
}

/// 署名取得レスポンスを解釈する。
pub fn interpret_poll(response: SignPollResponse) -> Result<AuthorityPoll, SigexError> {
    if let Some(message) = response.message {
        if is_cancellation(&message) {
            return Ok(AuthorityPoll::Rejected(message));
        }
        return Ok(AuthorityPoll::Pending);
    }
    let first = response
        .documents_to_sign
        .into_iter()
        .next()
        .ok_or_else(|| SigexError::Decode("documentsToSign が空です".to_string()))?;
    let der = qrsign_crypto::decode_signature_b64(&first.document.file.data)
        .map_err(|e| SigexError::Decode(e.to_string()))?;
    Ok(AuthorityPoll::Signed(der))
}

/// SIGEX APIクライアント。
#[derive(Clone)]
pub struct SigexClient {
    http: reqwest::Client,
    base_url: String,
}

impl SigexClient {
    /// 接続先とリクエストごとのタイムアウトから構築する。
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SigexError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// 接続先。
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, SigexError> {
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(SigexError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).chars().take(200).collect(),
            });
        }
        serde_json::from_slice(&body).map_err(|e| SigexError::Decode(e.to_string()))
    }

    /// QR署名手続きを登録する。
    pub async fn register_qr_signing(
        &self,
        description: &str,
    ) -> Result<AuthoritySession, SigexError> {
        let url = format!("{}/api/egovQr", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&EgovQrRequest {
                description: description.to_string(),
            })
            .send()
            .await?;
        let body: EgovQrResponse = Self::read_json(resp).await?;
        if let Some(message) = body.message {
            return Err(SigexError::Message(message));
        }
        if body.data_url.is_empty() || body.sign_url.is_empty() {
            return Err(SigexError::Decode(
                "dataURL または signURL がありません".to_string(),
            ));
        }

        let qr_image = qrsign_crypto::b64()
            .decode(body.qr_code.as_bytes())
            .map_err(|e| SigexError::Decode(format!("qrCode: {e}")))?;
        let external_id = body.id.unwrap_or_else(|| body.sign_url.clone());
        tracing::info!(external_id = %external_id, "QR署名手続きを登録");

        Ok(AuthoritySession {
            external_id,
            qr_image,
            data_url: body.data_url,
            sign_url: body.sign_url,
            mobile_link: body.mobile_link.filter(|l| !l.is_empty()),
            business_link: body.business_link.filter(|l| !l.is_empty()),
        })
    }

    /// 署名対象データを送信する。
    pub async fn send_data(
        &self,
        data_url: &str,
        payload: &SigningPayload,
    ) -> Result<(), SigexError> {
        let resp = self
            .http
            .post(data_url)
            .json(&data_submission(payload))
            .send()
            .await?;
        let body: serde_json::Value = Self::read_json(resp).await?;
        if let Some(message) = body.get("message").and_then(|m| m.as_str()) {
            return Err(SigexError::Message(message.to_string()));
        }
        tracing::debug!(filename = %payload.filename, "署名対象データを送信");
        Ok(())
    }

    /// CMS署名付きでドキュメントを登録する。
    pub async fn register_signed_document(
        &self,
        title: &str,
        description: &str,
        signature_der: &[u8],
    ) -> Result<String, SigexError> {
        let url = format!("{}/api", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&RegisterDocumentRequest {
                title: title.to_string(),
                description: description.to_string(),
                sign_type: SIGN_TYPE_CMS.to_string(),
                signature: qrsign_crypto::b64().encode(signature_der),
            })
            .send()
            .await?;
        let id = registered_id(Self::read_json(resp).await?)?;
        tracing::info!(authority_document_id = %id, "ドキュメントを登録");
        Ok(id)
    }

    /// 登録済みドキュメントへ原本を送信する。
    pub async fn send_document_data(&self, document_id: &str, data: &[u8]) -> Result<(), SigexError> {
        let url = format!("{}/api/{document_id}/data", self.base_url);
        let resp = self.post_octets(&url, data).await?;
        registered_id(Self::read_json(resp).await?)?;
        tracing::debug!(authority_document_id = %document_id, size = data.len(), "原本を送信");
        Ok(())
    }

    /// 登録済みドキュメントを署名機関に検証させる。
    pub async fn verify_registered_document(
        &self,
        document_id: &str,
        data: &[u8],
    ) -> Result<bool, SigexError> {
        let url = format!("{}/api/{document_id}/verify", self.base_url);
        let resp = self.post_octets(&url, data).await?;
        match registered_id(Self::read_json(resp).await?) {
            Ok(_) => Ok(true),
            Err(SigexError::Message(message)) => {
                tracing::info!(
                    authority_document_id = %document_id,
                    message = %message,
                    "署名機関の検証に不合格"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn post_octets(&self, url: &str, data: &[u8]) -> Result<reqwest::Response, SigexError> {
        Ok(self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, OCTET_STREAM)
            .body(data.to_vec())
            .send()
            .await?)
    }

    /// 署名の取得を1回試みる。
    pub async fn poll_signature(&self, sign_url: &str) -> Result<AuthorityPoll, SigexError> {
        let resp = self.http.get(sign_url).send().await?;
        let body: SignPollResponse = Self::read_json(resp).await?;
        interpret_poll(body)
    }
}

#[async_trait::async_trait]
impl SigningAuthority for SigexClient {
    async fn open_session(&self, description: &str) -> Result<AuthoritySession, AuthorityError> {
        Ok(self.register_qr_signing(description).await?)
    }

    async fn submit_document(
        &self,
        data_url: &str,
        payload: &SigningPayload,
    ) -> Result<(), AuthorityError> {
        Ok(self.send_data(data_url, payload).await?)
    }

    async fn fetch_signature(&self, sign_url: &str) -> Result<AuthorityPoll, AuthorityError> {
        Ok(self.poll_signature(sign_url).await?)
    }

    async fn register_document(
        &self,
        title: &str,
        description: &str,
        signature_der: &[u8],
    ) -> Result<String, AuthorityError> {
        Ok(self
            .register_signed_document(title, description, signature_der)
            .await?)
    }

    async fn upload_document_data(
        &self,
        authority_document_id: &str,
        data: &[u8],
    ) -> Result<(), AuthorityError> {
        Ok(self.send_document_data(authority_document_id, data).await?)
    }

    async fn verify_document(
        &self,
        authority_document_id: &str,
        data: &[u8],
    ) -> Result<bool, AuthorityError> {
        match self.verify_registered_document(authority_document_id, data).await {
            Ok(verified) => Ok(verified),
            Err(e) => match AuthorityError::from(e) {
                AuthorityError::Rejected(reason) => {
                    tracing::info!(
                        authority_document_id = %authority_document_id,
                        reason = %reason,
                        "署名機関が検証を拒否"
                    );
                    Ok(false)
                }
                unreachable => Err(unreachable),
            },
        }
    }
}
