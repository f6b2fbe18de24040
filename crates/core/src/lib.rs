//! # QRSign Core
//!
//! QR署名機関を介したドキュメント署名のオーケストレーションを実装する。
//!
//! ## 処理フロー
//! 1. `SigningOrchestrator::initiate_document` がドキュメントを確保し、署名機関にセッションを登録する
//! 2. 呼び出し側がQRコードを表示する
//! 3. `SigningOrchestrator::complete_document` が署名機関をポーリングし、署名を永続化する
//! 4. パッケージは各メンバーに同じ状態機械を独立に適用し、集約状態を導出する
//! 5. `PackageArchiveBuilder` が署名済みメンバーをZIPにまとめる
//!
//! 外部とのやり取りは全て `ports` のトレイトと `SigningAuthority` を経由する。

pub mod archive;
pub mod authority;
pub mod documents;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod ports;
pub mod verification;

#[cfg(test)]
mod test_helpers;

use std::time::Duration;

pub use archive::PackageArchiveBuilder;
pub use authority::{
    AuthorityPoll, AuthoritySession, ExternalSigningClient, PollOutcome, SessionRequest,
    SignedArtifact, SigningAuthority, SigningPayload,
};
pub use documents::{
    DocumentService, DocumentView, PackageSummary, UploadRequest, DEFAULT_MAX_UPLOAD_SIZE,
};
pub use error::{AuthorityError, RepositoryError, SigningError, StorageError};
pub use memory::{InMemoryBlobStorage, InMemoryRepository};
pub use orchestrator::{
    MemberInitiation, MemberReport, MemberStart, PackageReport, SigningOrchestrator,
    EXPIRED_REASON,
};
pub use ports::{BlobStorage, Repository};
pub use verification::{VerificationOutcome, VerificationReport, VerificationService};

/// ポーリングの既定試行回数。
pub const DEFAULT_POLL_RETRIES: u32 = 60;

/// ポーリングの既定間隔（秒）。
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 3;

/// パッケージメンバーの既定同時実行数。
pub const DEFAULT_PACKAGE_CONCURRENCY: usize = 4;

/// 署名完了待ちのポーリング方針。
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// 署名機関への試行回数の上限（データ送信とポーリングの合計）
    pub max_retries: u32,
    /// ポーリング間隔
    pub interval: Duration,
    /// 完了処理全体の期限
    pub deadline: Duration,
    /// 署名セッションの寿命。確保からこの時間を過ぎて完了しないセッションは放棄されたとみなす
    pub session_ttl: Duration,
    /// データ送信が通信エラーになった場合の再試行間隔
    pub submit_retry_interval: Duration,
}

impl PollPolicy {
    /// 試行回数と間隔から方針を作る。期限は `max_retries × interval` に30秒の余裕を加える。
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        let deadline = interval
            .saturating_mul(max_retries)
            .saturating_add(Duration::from_secs(30));
        Self {
            max_retries,
            interval,
            deadline,
            session_ttl: session_ttl_for(deadline),
            submit_retry_interval: Duration::from_secs(1),
        }
    }

    /// 期限を変更し、セッションの寿命もそれに合わせる。
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self.session_ttl = session_ttl_for(deadline);
        self
    }
}

/// QRの表示から完了待ちの開始までの猶予を含め、期限の2倍をセッションの寿命とする。
fn session_ttl_for(deadline: Duration) -> Duration {
    deadline.saturating_mul(2)
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_POLL_RETRIES,
            Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        )
    }
}

/// オーケストレータの設定。
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// ポーリング方針
    pub poll: PollPolicy,
    /// パッケージメンバーを同時に処理する上限
    pub package_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            package_concurrency: DEFAULT_PACKAGE_CONCURRENCY,
        }
    }
}
