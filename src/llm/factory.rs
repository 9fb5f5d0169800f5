//! 根据配置与环境变量构建 LLM 后端
//!
//! DeepSeek 走 OpenAI 兼容端点；都没有 Key 时使用 Mock，便于本地跑通编排流程。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();

    if provider == "deepseek" && (deepseek_key.is_some() || openai_key.is_some()) {
        let model = cfg
            .llm
            .deepseek
            .model
            .clone()
            .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());
        let base = cfg.llm.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
        tracing::info!("Using DeepSeek LLM ({})", model);
        Arc::new(OpenAiClient::new(
            Some(base),
            &model,
            deepseek_key.or(openai_key).as_deref(),
        ))
    } else if openai_key.is_some() {
        let model = cfg
            .llm
            .openai
            .model
            .clone()
            .unwrap_or_else(|| cfg.llm.model.clone());
        tracing::info!("Using OpenAI-compatible LLM ({})", model);
        Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &model,
            openai_key.as_deref(),
        ))
    } else {
        tracing::warn!("No API key set or provider unknown, using Mock LLM");
        Arc::new(MockLlmClient)
    }
}
