//! 能力层：每种意图对应一个可回答问题的能力
//!
//! 所有能力实现 Capability trait（name / requires_credential / answer），由
//! [`CapabilityRegistry`](crate::orchestration::CapabilityRegistry) 按意图类型注册，Dispatcher 调用时
//! 传入取消令牌与（需要时）会话委托令牌。

pub mod copilot;
pub mod knowledge;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use copilot::CopilotCapability;
pub use knowledge::KnowledgeCapability;

/// 能力执行错误；除 Unauthorized 外都只影响当前分支
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

/// 能力 trait：实例在并发请求间共享，实现必须可重入
#[async_trait]
pub trait Capability: Send + Sync {
    /// 结果来源名，写入 AgentResponse.source
    fn name(&self) -> &str;

    /// 是否需要会话的委托令牌
    fn requires_credential(&self) -> bool {
        false
    }

    async fn answer(
        &self,
        query: &str,
        credential: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, CapabilityError>;
}
