//! 意图分类
//!
//! 让 LLM 把用户输入拆成若干 `{type, query}` 子请求（JSON 数组）。
//! 兜底策略集中在 [`parse_intents`] + [`IntentClassifier::classify`] 一处：
//! 输出被 Markdown 代码块包裹时先剥掉；解析失败、空数组、LLM 报错都退化为单个通用知识意图，
//! 原始查询原样作为子查询。分类器不校验类型名，未知类型交给 Dispatcher 处理。

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::{complete_cancellable, LlmClient, LlmOutcome, Message};
use crate::orchestration::Intent;

const CLASSIFIER_PROMPT: &str = r#"You are an intent classifier for a multi-agent system. Analyze the user's query and identify which agents should handle it.

Available intent types:
- M365Email: Questions about emails, messages, inbox, mail
- M365Calendar: Questions about meetings, schedule, calendar, appointments
- M365Files: Questions about documents, files, SharePoint, OneDrive
- M365People: Questions about colleagues, organization, team members, expertise
- GeneralKnowledge: General questions not related to Microsoft 365 data

Rules:
1. A query can have multiple intents (e.g., "Summarize my emails and explain REST APIs" has M365Email + GeneralKnowledge)
2. If the query mentions personal data (my emails, my calendar, my files, my team), route to the appropriate M365 intent
3. If the query is about general concepts, technology, or information not in M365, use GeneralKnowledge
4. Extract the relevant sub-query for each intent

Respond with ONLY a JSON array, no other text:
[
  {"type": "IntentType", "query": "extracted sub-query for this intent"}
]

Example for "What meetings do I have tomorrow and what is Docker?":
[
  {"type": "M365Calendar", "query": "What meetings do I have tomorrow"},
  {"type": "GeneralKnowledge", "query": "What is Docker"}
]"#;

/// 分类输出无法使用的原因（仅用于日志，不向外传播）
#[derive(Error, Debug)]
pub enum IntentParseError {
    #[error("invalid intent JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty intent list")]
    Empty,
}

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?(.*)```").unwrap_or_else(|e| panic!("fence regex: {e}"))
    })
}

/// 去掉 ```json ... ``` 或 ``` ... ``` 包裹，返回去空白后的正文
pub fn extract_json(response: &str) -> &str {
    match fence_regex().captures(response).and_then(|c| c.get(1)) {
        Some(body) => body.as_str().trim(),
        None => response.trim(),
    }
}

/// 解析分类输出；调用方负责兜底
pub fn parse_intents(raw: &str) -> Result<Vec<Intent>, IntentParseError> {
    let intents: Option<Vec<Intent>> = serde_json::from_str(extract_json(raw))?;
    match intents {
        Some(list) if !list.is_empty() => Ok(list),
        _ => Err(IntentParseError::Empty),
    }
}

/// 意图分类器
pub struct IntentClassifier {
    llm: Arc<dyn LlmClient>,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 分类用户输入；结果非空，失败时为 `[GeneralKnowledge(query)]`
    pub async fn classify(&self, query: &str, cancel: &CancellationToken) -> Vec<Intent> {
        tracing::info!(query, "Analyzing intent");

        let messages = [
            Message::system(CLASSIFIER_PROMPT),
            Message::user(format!("User Query: {}", query)),
        ];

        let raw = match complete_cancellable(self.llm.as_ref(), &messages, cancel).await {
            LlmOutcome::Completed(text) => text,
            LlmOutcome::Failed(e) => {
                tracing::warn!(error = %e, "Intent classification call failed, defaulting to general knowledge");
                return vec![Intent::general(query)];
            }
            LlmOutcome::Cancelled => {
                tracing::debug!("Intent classification cancelled");
                return vec![Intent::general(query)];
            }
        };

        match parse_intents(&raw) {
            Ok(intents) => intents,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    raw = %raw,
                    "Failed to parse intent response, defaulting to general knowledge"
                );
                vec![Intent::general(query)]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::orchestration::IntentKind;

    fn classifier(reply: Result<String, String>) -> IntentClassifier {
        IntentClassifier::new(Arc::new(ScriptedLlmClient::new(vec![reply])))
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json("```json\n[1]\n```"), "[1]");
        assert_eq!(extract_json("```\n[2]\n```"), "[2]");
        assert_eq!(extract_json("  [3]  "), "[3]");
        assert_eq!(extract_json("Here you go:\n```json\n[4]\n```\nDone."), "[4]");
    }

    #[test]
    fn test_parse_null_and_empty() {
        assert!(matches!(parse_intents("null"), Err(IntentParseError::Empty)));
        assert!(matches!(parse_intents("[]"), Err(IntentParseError::Empty)));
        assert!(matches!(parse_intents("not json"), Err(IntentParseError::Json(_))));
    }

    #[tokio::test]
    async fn test_classify_multi_intent() {
        let c = classifier(Ok(r#"```json
[
  {"type": "M365Calendar", "query": "What meetings do I have tomorrow"},
  {"type": "GeneralKnowledge", "query": "What is Docker"}
]
```"#
            .to_string()));
        let intents = c
            .classify(
                "What meetings do I have tomorrow and what is Docker?",
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(intents.len(), 2);
        assert_eq!(intents[0].kind, IntentKind::Calendar);
        assert_eq!(intents[1].query, "What is Docker");
    }

    #[tokio::test]
    async fn test_invalid_json_falls_back_to_general() {
        let c = classifier(Ok("I think this is about email".to_string()));
        let intents = c.classify("Q", &CancellationToken::new()).await;
        assert_eq!(intents, vec![Intent::general("Q")]);
    }

    #[tokio::test]
    async fn test_empty_array_falls_back_to_general() {
        let c = classifier(Ok("[]".to_string()));
        let intents = c.classify("hello", &CancellationToken::new()).await;
        assert_eq!(intents, vec![Intent::general("hello")]);
    }

    #[tokio::test]
    async fn test_llm_error_falls_back_to_general() {
        let c = classifier(Err("503".to_string()));
        let intents = c.classify("hello", &CancellationToken::new()).await;
        assert_eq!(intents, vec![Intent::general("hello")]);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_kept() {
        let c = classifier(Ok(r#"[{"type":"Weather","query":"rain?"}]"#.to_string()));
        let intents = c.classify("rain?", &CancellationToken::new()).await;
        assert_eq!(intents[0].kind, IntentKind::Unknown("Weather".into()));
    }
}
