//! 通用知识能力：直接让 LLM 回答与个人数据无关的问题

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::capabilities::{Capability, CapabilityError};
use crate::llm::{complete_cancellable, LlmClient, LlmOutcome, Message};

const KNOWLEDGE_PROMPT: &str = "You are a knowledgeable assistant. Answer the user's question clearly and concisely. \
If the question is about technology, include a short example when it helps. \
Do not claim access to the user's emails, calendar, files or colleagues.";

pub struct KnowledgeCapability {
    llm: Arc<dyn LlmClient>,
}

impl KnowledgeCapability {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Capability for KnowledgeCapability {
    fn name(&self) -> &str {
        "llm_knowledge"
    }

    async fn answer(
        &self,
        query: &str,
        _credential: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, CapabilityError> {
        let messages = [Message::system(KNOWLEDGE_PROMPT), Message::user(query)];
        match complete_cancellable(self.llm.as_ref(), &messages, cancel).await {
            LlmOutcome::Completed(text) => Ok(text),
            LlmOutcome::Failed(e) => Err(CapabilityError::Failed(e)),
            LlmOutcome::Cancelled => Err(CapabilityError::Cancelled),
        }
    }
}
