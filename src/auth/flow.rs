//! 登录流程：发起登录（CSRF state）、回调换令牌、登出
//!
//! 供 HTTP 入口的 /auth/login、/auth/callback、/auth/logout 使用；state 一次性，10 分钟过期。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::RwLock;

use crate::auth::{CachedCredential, CredentialState, IdentityError, IdentityProvider, TokenCache};

const PENDING_LOGIN_TTL: Duration = Duration::from_secs(600);
/// 未完成登录的上限；超出时挤掉最早的一条
const MAX_PENDING_LOGINS: usize = 1024;

#[derive(Error, Debug)]
pub enum AuthFlowError {
    #[error("Invalid state parameter")]
    InvalidState,

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

struct PendingLogin {
    session_id: String,
    created_at: Instant,
    /// 发起顺序，用于挤掉最早的一条
    seq: u64,
}

pub struct AuthFlow {
    identity: Arc<dyn IdentityProvider>,
    cache: Arc<dyn TokenCache>,
    pending: RwLock<HashMap<String, PendingLogin>>,
    next_seq: AtomicU64,
}

impl AuthFlow {
    pub fn new(identity: Arc<dyn IdentityProvider>, cache: Arc<dyn TokenCache>) -> Self {
        Self {
            identity,
            cache,
            pending: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// 为会话生成 state 并返回授权 URL
    pub async fn begin_login(&self, session_id: &str) -> Result<String, AuthFlowError> {
        let state = uuid::Uuid::new_v4().to_string();
        let url = self.identity.authorization_url(&state)?;

        let mut pending = self.pending.write().await;
        pending.retain(|_, p| p.created_at.elapsed() < PENDING_LOGIN_TTL);
        while pending.len() >= MAX_PENDING_LOGINS {
            let oldest = pending
                .iter()
                .min_by_key(|(_, p)| p.seq)
                .map(|(state, _)| state.clone());
            let Some(oldest) = oldest else { break };
            pending.remove(&oldest);
            tracing::warn!("Too many pending logins, dropping the oldest");
        }
        pending.insert(
            state,
            PendingLogin {
                session_id: session_id.to_string(),
                created_at: Instant::now(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            },
        );
        Ok(url)
    }

    /// 校验 state、用授权码换令牌并写入缓存；返回对应的会话 ID
    pub async fn complete_login(&self, state: &str, code: &str) -> Result<String, AuthFlowError> {
        let login = self
            .pending
            .write()
            .await
            .remove(state)
            .filter(|p| p.created_at.elapsed() < PENDING_LOGIN_TTL)
            .ok_or(AuthFlowError::InvalidState)?;

        let grant = self.identity.exchange_code(code).await?;
        self.cache
            .store(
                &login.session_id,
                CachedCredential::from_grant(&login.session_id, grant),
            )
            .await;
        tracing::info!(session_id = %login.session_id, "Token acquired for session");
        Ok(login.session_id)
    }

    /// 未完成的登录数
    pub async fn pending_logins(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn logout(&self, session_id: &str) -> bool {
        self.cache.evict(session_id).await
    }

    pub async fn status(&self, session_id: &str) -> CredentialState {
        self.cache.status(session_id).await
    }
}
