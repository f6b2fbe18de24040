//! # 署名セッション表
//!
//! 署名開始APIが作ったセッションを、完了APIが呼ばれるまでプロセス内に保持する。
//! 完了APIはセッションを取り出して消費するため、同じセッションの完了は1回だけ実行される。
//! 完了APIが呼ばれないまま寿命を過ぎたセッションは `evict_expired` で取り除く。

use std::collections::HashMap;
use std::time::Duration;

use qrsign_types::SigningSession;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::GatewayError;

struct PendingSession {
    owner_id: String,
    session: SigningSession,
    inserted_at: Instant,
}

/// セッションID → 開始済みセッション。
#[derive(Default)]
pub struct SessionTable {
    pending: Mutex<HashMap<String, PendingSession>>,
}

impl SessionTable {
    /// セッションを登録する。
    pub async fn insert(&self, owner_id: &str, session: SigningSession) {
        self.pending.lock().await.insert(
            session.id.clone(),
            PendingSession {
                owner_id: owner_id.to_string(),
                session,
                inserted_at: Instant::now(),
            },
        );
    }

    /// 取り出したセッションを使わずに戻す。
    pub async fn restore(&self, owner_id: &str, sessions: Vec<SigningSession>) {
        let mut pending = self.pending.lock().await;
        let now = Instant::now();
        for session in sessions {
            pending.insert(
                session.id.clone(),
                PendingSession {
                    owner_id: owner_id.to_string(),
                    session,
                    inserted_at: now,
                },
            );
        }
    }

    /// 登録から `max_age` 以上経過したセッションを取り除いて返す。
    pub async fn evict_expired(&self, max_age: Duration) -> Vec<SigningSession> {
        let mut pending = self.pending.lock().await;
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() >= max_age)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| pending.remove(id))
            .map(|entry| entry.session)
            .collect()
    }

    /// セッションを取り出す。他の所有者のセッションは取り出さずに残す。
    pub async fn take(&self, session_id: &str, owner_id: &str) -> Result<SigningSession, GatewayError> {
        let mut pending = self.pending.lock().await;
        match pending.get(session_id) {
            None => Err(GatewayError::NotFound(format!("session {session_id}"))),
            Some(entry) if entry.owner_id != owner_id => Err(GatewayError::Forbidden(format!(
                "session {session_id} の所有者ではありません"
            ))),
            Some(_) => pending
                .remove(session_id)
                .map(|entry| entry.session)
                .ok_or_else(|| GatewayError::NotFound(format!("session {session_id}"))),
        }
    }

    /// 複数のセッションをまとめて取り出す。1件でも取り出せなければ何も取り出さない。
    pub async fn take_all(
        &self,
        session_ids: &[String],
        owner_id: &str,
    ) -> Result<Vec<SigningSession>, GatewayError> {
        let mut pending = self.pending.lock().await;
        for id in session_ids {
            match pending.get(id) {
                None => return Err(GatewayError::NotFound(format!("session {id}"))),
                Some(entry) if entry.owner_id != owner_id => {
                    return Err(GatewayError::Forbidden(format!(
                        "session {id} の所有者ではありません"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(session_ids
            .iter()
            .filter_map(|id| pending.remove(id))
            .map(|entry| entry.session)
            .collect())
    }

    /// 保持しているセッション数。
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
