//! 编排错误类型
//!
//! 分类失败与单个能力失败都在本地吸收，不会出现在这里；这里只有需要浮出 Pipeline 的错误。
//! 与 [`ReplyPolicy`](crate::core::ReplyPolicy) 配合：每种错误映射为一条固定的、对用户安全的回复。

use thiserror::Error;

use crate::auth::TokenCacheError;

/// 浮出 Dispatcher / Pipeline 的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 能力返回 401 等无权限错误，需要用户重新登录
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 会话令牌缺失或无法静默刷新
    #[error(transparent)]
    Credential(#[from] TokenCacheError),

    /// 超过 orchestration.timeout_seconds
    #[error("Request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// 调用方主动取消（与超时区分）
    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// 是否需要用户登录（无权限 / 令牌缺失 / 需要重新授权）
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Unauthorized(_)
                | OrchestratorError::Credential(TokenCacheError::SessionTokenMissing)
                | OrchestratorError::Credential(TokenCacheError::ReAuthRequired)
        )
    }
}
