//! 结果合成
//!
//! 只看成功的响应：0 条返回固定哨兵，1 条原样返回，2 条及以上才调用合成 LLM（恰好一次）。

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::OrchestratorError;
use crate::llm::{complete_cancellable, LlmClient, LlmOutcome, Message};
use crate::orchestration::AgentResponse;

pub const NO_ANSWER_REPLY: &str = "I wasn't able to find an answer to your question.";
pub const SYNTHESIS_FAILED_REPLY: &str = "I couldn't synthesize a response.";

const SYNTHESIS_PROMPT: &str = r#"You are a response synthesizer. Your job is to combine multiple agent responses into a single,
coherent response that addresses the user's original query.

Instructions:
1. Analyze all the agent responses
2. Combine them into a single, well-organized response
3. Maintain clear structure - if there are multiple topics, organize them with headers or clear transitions
4. Remove any redundancy between responses
5. Ensure the response directly addresses the user's original query
6. Keep the tone helpful and conversational
7. If one response is about M365 data (emails, calendar, etc.) and another is general knowledge,
   present the M365 data first, then the general information"#;

#[derive(Serialize)]
struct SourcedContent<'a> {
    source: &'a str,
    content: &'a str,
}

/// 把成功响应序列化成 `[{source, content}, ...]`
pub fn serialize_responses(responses: &[&AgentResponse]) -> String {
    let items: Vec<SourcedContent<'_>> = responses
        .iter()
        .map(|r| SourcedContent {
            source: &r.source,
            content: &r.content,
        })
        .collect();
    serde_json::to_string(&items).unwrap_or_else(|_| "[]".to_string())
}

pub struct ResponseSynthesizer {
    llm: Arc<dyn LlmClient>,
}

impl ResponseSynthesizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn synthesize(
        &self,
        original_query: &str,
        responses: &[AgentResponse],
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        let successful: Vec<&AgentResponse> = responses.iter().filter(|r| r.success).collect();

        match successful.as_slice() {
            [] => return Ok(NO_ANSWER_REPLY.to_string()),
            [only] => return Ok(only.content.clone()),
            _ => {}
        }

        tracing::info!(count = successful.len(), "Synthesizing responses");
        let messages = [
            Message::system(SYNTHESIS_PROMPT),
            Message::user(format!(
                "Original User Query: {}\n\nAgent Responses:\n{}\n\nSynthesized Response:",
                original_query,
                serialize_responses(&successful)
            )),
        ];

        match complete_cancellable(self.llm.as_ref(), &messages, cancel).await {
            LlmOutcome::Completed(text) if text.trim().is_empty() => {
                Ok(SYNTHESIS_FAILED_REPLY.to_string())
            }
            LlmOutcome::Completed(text) => Ok(text),
            LlmOutcome::Failed(e) => Err(OrchestratorError::Internal(format!(
                "synthesis failed: {e}"
            ))),
            LlmOutcome::Cancelled => Err(OrchestratorError::Cancelled),
        }
    }
}
