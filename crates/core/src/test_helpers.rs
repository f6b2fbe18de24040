//! # テスト用共通ヘルパー
//!
//! authority, orchestrator, documents, verification, archiveのテストで共有する
//! 台本どおりに応答する署名機関と、サンプルデータ。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qrsign_crypto::fixtures;
use qrsign_types::{
    unix_now, Document, DocumentStatus, Package, Signature, SignerIdentity, SubjectKind,
};

use crate::authority::{
    AuthorityPoll, AuthoritySession, SessionRequest, SigningAuthority, SigningPayload,
};
use crate::error::AuthorityError;
use crate::memory::{InMemoryBlobStorage, InMemoryRepository};
use crate::ports::{BlobStorage, Repository};
use crate::{OrchestratorConfig, PollPolicy};

/// ミリ秒単位で回るポーリング方針。
pub fn fast_policy(max_retries: u32) -> PollPolicy {
    PollPolicy {
        max_retries,
        interval: Duration::from_millis(5),
        deadline: Duration::from_secs(10),
        session_ttl: Duration::from_secs(20),
        submit_retry_interval: Duration::from_millis(1),
    }
}

pub fn fast_config(max_retries: u32) -> OrchestratorConfig {
    OrchestratorConfig {
        poll: fast_policy(max_retries),
        package_concurrency: 2,
    }
}

pub fn individual() -> SignerIdentity {
    SignerIdentity::individual("123456789012", "Test User").unwrap()
}

pub fn session_request(session_id: &str, document_id: &str) -> SessionRequest {
    SessionRequest {
        session_id: session_id.into(),
        subject_kind: SubjectKind::Document,
        document_id: document_id.into(),
        package_id: None,
        description: "Подписание документа".into(),
    }
}

/// Blobを伴わないドキュメント（version 0、未保存）。
pub fn sample_document(id: &str, owner: &str, content: &[u8]) -> Document {
    let now = unix_now();
    Document {
        id: id.into(),
        title: format!("Document {id}"),
        filename: format!("{id}.pdf"),
        mime_type: "application/pdf".into(),
        file_size: content.len() as u64,
        owner_id: owner.into(),
        blob_ref: format!("documents/{id}/{id}.pdf"),
        digest: qrsign_crypto::content_digest(content),
        status: DocumentStatus::Uploaded,
        signature_id: None,
        active_session: None,
        failure_reason: None,
        session_started_at: None,
        package_id: None,
        authority_document_id: None,
        signed_copy_ref: None,
        version: 0,
        created_at: now,
        updated_at: now,
    }
}

pub fn sample_signature(id: &str, document_id: &str) -> Signature {
    Signature {
        id: id.into(),
        document_id: document_id.into(),
        blob_ref: format!("signatures/{document_id}/{document_id}.pdf.cms"),
        signer: individual(),
        created_at: unix_now(),
    }
}

/// ドキュメントとその本体を保存する。
pub async fn seed_document(
    repo: &InMemoryRepository,
    storage: &InMemoryBlobStorage,
    id: &str,
    owner: &str,
    content: &[u8],
) -> Document {
    let document = sample_document(id, owner, content);
    storage.write_file(&document.blob_ref, content).await.unwrap();
    repo.save_document(&document).await.unwrap()
}

/// メンバーを持つパッケージを保存する。
pub async fn seed_package(repo: &InMemoryRepository, id: &str, owner: &str, members: &[&str]) -> Package {
    let now = unix_now();
    let package = Package {
        id: id.into(),
        title: format!("Package {id}"),
        description: String::new(),
        owner_id: owner.into(),
        document_ids: members.iter().map(|m| m.to_string()).collect(),
        version: 0,
        created_at: now,
        updated_at: now,
    };
    repo.save_package(&package).await.unwrap()
}

/// インメモリのリポジトリとストレージ。
pub fn memory_ports() -> (Arc<InMemoryRepository>, Arc<InMemoryBlobStorage>) {
    (
        Arc::new(InMemoryRepository::new()),
        Arc::new(InMemoryBlobStorage::new()),
    )
}

/// 署名取得の振る舞い。
#[derive(Debug, Clone)]
pub enum PollMode {
    /// 指定回数 PENDING を返した後に署名を返す
    SignAfter(u32),
    /// 常に PENDING
    NeverSign,
    /// 最初のポーリングで取り消しを返す
    Reject(String),
}

/// 台本どおりに応答する署名機関。
///
/// 署名は送信されたデータのSHA-256に対するデタッチドCMSを返すため、
/// 取得した署名は検証サービスで `Valid` になる。
pub struct ScriptedAuthority {
    mode: PollMode,
    legal_entity: bool,
    open_failure: Option<AuthorityError>,
    failing_submits: AtomicU32,
    rejected_files: HashSet<String>,
    /// セッション番号 → 送信されたデータのダイジェスト
    submitted: Mutex<HashMap<String, Vec<u8>>>,
    /// セッション番号 → PENDING を返した回数
    pending: Mutex<HashMap<String, u32>>,
    /// 登録ID → 送信された原本のダイジェスト
    registered: Mutex<HashMap<String, Option<Vec<u8>>>>,
    failing_registration: bool,
    sessions: AtomicU32,
    submits: AtomicU32,
    polls: AtomicU32,
}

impl ScriptedAuthority {
    pub fn new(mode: PollMode) -> Self {
        Self {
            mode,
            legal_entity: false,
            open_failure: None,
            failing_submits: AtomicU32::new(0),
            rejected_files: HashSet::new(),
            submitted: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            registered: Mutex::new(HashMap::new()),
            failing_registration: false,
            sessions: AtomicU32::new(0),
            submits: AtomicU32::new(0),
            polls: AtomicU32::new(0),
        }
    }

    /// 法人証明書で署名する。
    pub fn legal_entity(mut self) -> Self {
        self.legal_entity = true;
        self
    }

    /// セッション登録を失敗させる。
    pub fn failing_open(mut self, error: AuthorityError) -> Self {
        self.open_failure = Some(error);
        self
    }

    /// 最初の `n` 回のデータ送信を通信エラーにする。
    pub fn failing_submits(self, n: u32) -> Self {
        self.failing_submits.store(n, Ordering::SeqCst);
        self
    }

    /// 指定したファイル名の送信を署名者の取り消しとして扱う。
    pub fn rejecting(mut self, filename: &str) -> Self {
        self.rejected_files.insert(filename.to_string());
        self
    }

    /// ドキュメント登録を通信エラーにする。
    pub fn failing_registration(mut self) -> Self {
        self.failing_registration = true;
        self
    }

    pub fn registrations(&self) -> usize {
        self.registered.lock().unwrap().len()
    }

    pub fn sessions(&self) -> u32 {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn submits(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    fn session_key(url: &str) -> String {
        url.trim_start_matches("https://authority.test/")
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

#[async_trait::async_trait]
impl SigningAuthority for ScriptedAuthority {
    async fn open_session(&self, _description: &str) -> Result<AuthoritySession, AuthorityError> {
        if let Some(err) = &self.open_failure {
            return Err(err.clone());
        }
        let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AuthoritySession {
            external_id: format!("ext-{n}"),
            qr_image: vec![0x89, b'P', b'N', b'G'],
            data_url: format!("https://authority.test/{n}/data"),
            sign_url: format!("https://authority.test/{n}/sign"),
            mobile_link: Some(format!("egov://mobile/{n}")),
            business_link: Some(format!("egov://business/{n}")),
        })
    }

    async fn submit_document(
        &self,
        data_url: &str,
        payload: &SigningPayload,
    ) -> Result<(), AuthorityError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_submits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_submits.store(remaining - 1, Ordering::SeqCst);
            return Err(AuthorityError::Unreachable("read timed out".into()));
        }
        if self.rejected_files.contains(&payload.filename) {
            return Err(AuthorityError::Rejected("Подписание отменено".into()));
        }
        self.submitted.lock().unwrap().insert(
            Self::session_key(data_url),
            qrsign_crypto::sha256(&payload.data).to_vec(),
        );
        Ok(())
    }

    async fn fetch_signature(&self, sign_url: &str) -> Result<AuthorityPoll, AuthorityError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let key = Self::session_key(sign_url);

        let ready = match &self.mode {
            PollMode::NeverSign => false,
            PollMode::Reject(reason) => return Ok(AuthorityPoll::Rejected(reason.clone())),
            PollMode::SignAfter(n) => {
                let mut pending = self.pending.lock().unwrap();
                let seen = pending.entry(key.clone()).or_insert(0);
                if *seen >= *n {
                    true
                } else {
                    *seen += 1;
                    false
                }
            }
        };
        if !ready {
            return Ok(AuthorityPoll::Pending);
        }

        let digest = self
            .submitted
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| AuthorityError::Rejected("データが送信されていません".into()))?;
        let subject = if self.legal_entity {
            fixtures::legal_entity_subject()
        } else {
            fixtures::individual_subject()
        };
        Ok(AuthorityPoll::Signed(fixtures::detached_signed_data(
            &digest, &subject,
        )))
    }

    async fn register_document(
        &self,
        _title: &str,
        _description: &str,
        _signature_der: &[u8],
    ) -> Result<String, AuthorityError> {
        if self.failing_registration {
            return Err(AuthorityError::Unreachable("connection reset".into()));
        }
        let mut registered = self.registered.lock().unwrap();
        let id = (registered.len() + 1).to_string();
        registered.insert(id.clone(), None);
        Ok(id)
    }

    async fn upload_document_data(
        &self,
        authority_document_id: &str,
        data: &[u8],
    ) -> Result<(), AuthorityError> {
        let mut registered = self.registered.lock().unwrap();
        let entry = registered
            .get_mut(authority_document_id)
            .ok_or_else(|| AuthorityError::Rejected("Документ не найден".into()))?;
        *entry = Some(qrsign_crypto::sha256(data).to_vec());
        Ok(())
    }

    async fn verify_document(
        &self,
        authority_document_id: &str,
        data: &[u8],
    ) -> Result<bool, AuthorityError> {
        let registered = self.registered.lock().unwrap();
        let stored = registered
            .get(authority_document_id)
            .ok_or_else(|| AuthorityError::Rejected("Документ не найден".into()))?;
        Ok(stored.as_deref() == Some(qrsign_crypto::sha256(data).as_slice()))
    }
}
