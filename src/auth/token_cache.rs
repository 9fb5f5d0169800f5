//! 会话令牌缓存
//!
//! 每个会话键一条凭据，状态机：Absent / Valid / Expiring / Invalid。
//! - `store`：登录回调换到令牌后写入（任意状态 → Valid）
//! - `get`：Valid 直接返回；Expiring（过期前 skew 窗口内）用账户标识静默刷新一次；Invalid 直接要求重新登录
//! - `evict`：登出时删除（任意状态 → Absent），同时让身份提供方丢弃该账户的 refresh token
//!
//! 并发：外层 RwLock 只在查找/插入槽位时持有；同一会话的「读-判-刷新-写」在槽位 Mutex 内完成，
//! 不同会话互不阻塞。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::auth::{IdentityError, IdentityProvider, TokenGrant};

/// 缓存中的凭据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedCredential {
    pub session_id: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    /// 静默刷新所需的账户引用；没有则只能用到过期
    pub account_id: Option<String>,
}

impl CachedCredential {
    pub fn from_grant(session_id: impl Into<String>, grant: TokenGrant) -> Self {
        Self {
            session_id: session_id.into(),
            access_token: grant.access_token,
            expires_at: grant.expires_at,
            account_id: grant.account_id,
        }
    }
}

/// 令牌缓存错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenCacheError {
    #[error("No token found for session. Please login first.")]
    SessionTokenMissing,

    #[error("Session expired. Please login again.")]
    ReAuthRequired,

    /// 刷新时网络或服务端错误（非交互要求），按普通内部错误处理
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Token lookup cancelled")]
    Cancelled,
}

/// 单个会话凭据所处状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Absent,
    Valid,
    Expiring,
    Invalid,
}

/// 令牌缓存接口：后端可以是内存表，也可以换成外部 KV，调度层只依赖此 trait
#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn store(&self, session_id: &str, credential: CachedCredential);

    /// 取可用的 access token，必要时静默刷新
    async fn get(&self, session_id: &str, cancel: &CancellationToken)
        -> Result<String, TokenCacheError>;

    /// 删除会话凭据；返回是否存在过
    async fn evict(&self, session_id: &str) -> bool;

    /// 查询状态（不触发刷新）
    async fn status(&self, session_id: &str) -> CredentialState;
}

#[derive(Debug)]
struct Entry {
    credential: CachedCredential,
    /// 静默刷新被拒后置位，直到重新 store 或 evict
    invalid: bool,
}

type Slot = Arc<Mutex<Option<Entry>>>;

/// 刷新提前量上限（一天）
const MAX_REFRESH_SKEW_SECS: i64 = 86_400;

/// 内存令牌缓存
pub struct InMemoryTokenCache {
    slots: RwLock<HashMap<String, Slot>>,
    identity: Arc<dyn IdentityProvider>,
    skew: Duration,
}

impl InMemoryTokenCache {
    pub fn new(identity: Arc<dyn IdentityProvider>, refresh_skew_secs: i64) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            identity,
            skew: Duration::seconds(refresh_skew_secs.clamp(0, MAX_REFRESH_SKEW_SECS)),
        }
    }

    /// 当前缓存的会话数
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    async fn slot(&self, session_id: &str) -> Option<Slot> {
        self.slots.read().await.get(session_id).cloned()
    }

    fn state_of(&self, entry: &Entry, now: DateTime<Utc>) -> CredentialState {
        if entry.invalid {
            CredentialState::Invalid
        } else if entry
            .credential
            .expires_at
            .checked_sub_signed(self.skew)
            .is_some_and(|refresh_at| refresh_at > now)
        {
            CredentialState::Valid
        } else {
            CredentialState::Expiring
        }
    }
}

#[async_trait]
impl TokenCache for InMemoryTokenCache {
    async fn store(&self, session_id: &str, mut credential: CachedCredential) {
        credential.session_id = session_id.to_string();
        let expires_at = credential.expires_at;
        let new_account = credential.account_id.clone();
        let slot = Arc::new(Mutex::new(Some(Entry {
            credential,
            invalid: false,
        })));
        let replaced = self.slots.write().await.insert(session_id.to_string(), slot);
        tracing::info!(session_id, %expires_at, "Token stored for session");

        // 旧槽位上若有刷新在进行，等它结束后再丢弃旧账户
        if let Some(old) = replaced {
            let old_account = old.lock().await.take().and_then(|e| e.credential.account_id);
            if let Some(account) = old_account.filter(|a| Some(a) != new_account.as_ref()) {
                self.identity.forget(&account).await;
            }
        }
    }

    async fn get(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String, TokenCacheError> {
        let slot = self
            .slot(session_id)
            .await
            .ok_or(TokenCacheError::SessionTokenMissing)?;
        let mut guard = slot.lock().await;
        let entry = guard.as_mut().ok_or(TokenCacheError::SessionTokenMissing)?;

        match self.state_of(entry, Utc::now()) {
            CredentialState::Valid => return Ok(entry.credential.access_token.clone()),
            CredentialState::Invalid => return Err(TokenCacheError::ReAuthRequired),
            CredentialState::Absent | CredentialState::Expiring => {}
        }

        tracing::info!(session_id, "Token expired or expiring soon, attempting refresh");

        let Some(account_id) = entry.credential.account_id.clone() else {
            tracing::warn!(session_id, "No account on record, returning cached token");
            return Ok(entry.credential.access_token.clone());
        };

        let refreshed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TokenCacheError::Cancelled),
            r = self.identity.refresh_silently(&account_id) => r,
        };

        match refreshed {
            Ok(grant) => {
                entry.credential.access_token = grant.access_token;
                entry.credential.expires_at = grant.expires_at;
                if grant.account_id.is_some() {
                    entry.credential.account_id = grant.account_id;
                }
                tracing::info!(
                    session_id,
                    expires_at = %entry.credential.expires_at,
                    "Token refreshed silently"
                );
                Ok(entry.credential.access_token.clone())
            }
            Err(IdentityError::UiRequired(reason)) => {
                tracing::warn!(
                    session_id,
                    %reason,
                    "Silent token acquisition failed, user needs to re-authenticate"
                );
                entry.invalid = true;
                Err(TokenCacheError::ReAuthRequired)
            }
            Err(other) => {
                tracing::error!(session_id, error = %other, "Token refresh failed");
                Err(TokenCacheError::RefreshFailed(other.to_string()))
            }
        }
    }

    async fn evict(&self, session_id: &str) -> bool {
        let removed = self.slots.write().await.remove(session_id);
        match removed {
            Some(slot) => {
                // 正在刷新的持有者随后会看到 None
                let entry = slot.lock().await.take();
                if let Some(account) = entry.and_then(|e| e.credential.account_id) {
                    self.identity.forget(&account).await;
                }
                tracing::info!(session_id, "Token cache cleared for session");
                true
            }
            None => false,
        }
    }

    async fn status(&self, session_id: &str) -> CredentialState {
        let Some(slot) = self.slot(session_id).await else {
            return CredentialState::Absent;
        };
        let guard = slot.lock().await;
        match guard.as_ref() {
            Some(entry) => self.state_of(entry, Utc::now()),
            None => CredentialState::Absent,
        }
    }
}
