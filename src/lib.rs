//! Concierge - Microsoft 365 多能力对话编排
//!
//! 模块划分：
//! - **app**: 组件装配（LLM、令牌缓存、登录流程、编排 Pipeline）
//! - **auth**: 会话令牌缓存、OAuth 身份提供方、登录流程
//! - **capabilities**: 能力实现（M365 Copilot、通用知识）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与用户回复映射
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化
//! - **orchestration**: 意图分类、调度、结果合成

pub mod app;
pub mod auth;
pub mod capabilities;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod orchestration;

pub use app::{build_components, AppComponents};
pub use orchestration::OrchestrationPipeline;
