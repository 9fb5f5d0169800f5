//! 应用装配
//!
//! 供 REPL 与 HTTP 入口共用：build_components 从配置构建 LLM、令牌缓存、登录流程，
//! build_pipeline 按意图类型注册能力并组装编排 Pipeline。

use std::sync::Arc;

use crate::auth::{AuthFlow, IdentityProvider, InMemoryTokenCache, OAuthIdentityProvider, TokenCache};
use crate::capabilities::{Capability, CapabilityError, CopilotCapability, KnowledgeCapability};
use crate::config::AppConfig;
use crate::llm::{create_llm_from_config, LlmClient};
use crate::orchestration::{
    CapabilityRegistry, Dispatcher, IntentClassifier, IntentKind, OrchestrationPipeline,
    ResponseSynthesizer,
};

/// 预构建的应用组件，可多会话共享
pub struct AppComponents {
    pub pipeline: Arc<OrchestrationPipeline>,
    pub auth: Arc<AuthFlow>,
    pub llm: Arc<dyn LlmClient>,
}

/// 按意图类型注册能力：四个 M365 领域共用同一个 HTTP 客户端
pub fn build_registry(
    cfg: &AppConfig,
    llm: Arc<dyn LlmClient>,
) -> Result<CapabilityRegistry, CapabilityError> {
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(cfg.graph.request_timeout_secs))
        .build()
        .map_err(|e| CapabilityError::Failed(e.to_string()))?;

    let copilot = |domain: &'static str| -> Arc<dyn Capability> {
        Arc::new(CopilotCapability::with_client(http.clone(), &cfg.graph, domain))
    };

    Ok(CapabilityRegistry::new()
        .register(IntentKind::Email, copilot("email"))
        .register(IntentKind::Calendar, copilot("calendar"))
        .register(IntentKind::Files, copilot("files"))
        .register(IntentKind::People, copilot("people"))
        .register(IntentKind::GeneralKnowledge, Arc::new(KnowledgeCapability::new(llm))))
}

/// 组装编排 Pipeline；分类、通用知识、合成共用同一个 LLM 客户端
pub fn build_pipeline(
    cfg: &AppConfig,
    llm: Arc<dyn LlmClient>,
    tokens: Arc<dyn TokenCache>,
) -> Result<OrchestrationPipeline, CapabilityError> {
    let settings = cfg.orchestration.clone().validated();
    let registry = Arc::new(build_registry(cfg, llm.clone())?);
    tracing::info!(
        capabilities = registry.len(),
        parallel = settings.enable_parallel_execution,
        max_agent_calls = settings.max_agent_calls,
        timeout_seconds = settings.timeout_seconds,
        "Orchestration pipeline configured"
    );

    Ok(OrchestrationPipeline::new(
        IntentClassifier::new(llm.clone()),
        Dispatcher::new(registry, Some(tokens), &settings),
        ResponseSynthesizer::new(llm),
        settings,
    ))
}

/// 从配置构建全部组件
pub fn build_components(cfg: &AppConfig) -> Result<AppComponents, CapabilityError> {
    let llm = create_llm_from_config(cfg);
    let identity: Arc<dyn IdentityProvider> = Arc::new(OAuthIdentityProvider::new(cfg.auth.clone()));
    let tokens = Arc::new(InMemoryTokenCache::new(
        identity.clone(),
        cfg.auth.refresh_skew_secs,
    ));
    let auth = Arc::new(AuthFlow::new(identity, tokens.clone()));
    let pipeline = Arc::new(build_pipeline(cfg, llm.clone(), tokens)?);

    Ok(AppComponents {
        pipeline,
        auth,
        llm,
    })
}
