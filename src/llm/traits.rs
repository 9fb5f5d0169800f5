//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient；调用方通过 [`complete_cancellable`]
//! 在取消令牌触发时立即放弃等待。

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::Message;

/// LLM 客户端 trait：非流式完成；实例在并发请求间共享
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// LLM 调用结果：完成 / 失败 / 被取消
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmOutcome {
    Completed(String),
    Failed(String),
    Cancelled,
}

/// 在取消令牌下调用 complete；令牌先触发则丢弃进行中的请求
pub async fn complete_cancellable(
    llm: &dyn LlmClient,
    messages: &[Message],
    cancel: &CancellationToken,
) -> LlmOutcome {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => LlmOutcome::Cancelled,
        result = llm.complete(messages) => match result {
            Ok(text) => LlmOutcome::Completed(text),
            Err(e) => LlmOutcome::Failed(e),
        },
    }
}
