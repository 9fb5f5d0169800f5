//! Mock LLM 客户端（用于本地运行与测试，无需 API）
//!
//! - `MockLlmClient`：回显最后一条 User 消息；分类时输出非 JSON，因此总是回落到通用知识意图。
//! - `ScriptedLlmClient`：按顺序返回预设结果，记录调用次数与收到的消息，可模拟延迟。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(format!("Echo from Mock: {}", last_user))
    }
}

/// 脚本化客户端：队列耗尽后返回 fallback
#[derive(Debug)]
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<Result<String, String>>>,
    fallback: Result<String, String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    received: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            fallback: Err("script exhausted".to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        }
    }

    /// 每次调用都返回同一段文本
    pub fn always(text: impl Into<String>) -> Self {
        let mut client = Self::new(Vec::new());
        client.fallback = Ok(text.into());
        client
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 历次调用收到的消息（按调用顺序）
    pub fn received(&self) -> Vec<Vec<Message>> {
        self.received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut received) = self.received.lock() {
            received.push(messages.to_vec());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
