//! 编排层：意图分类、能力注册表、调度、结果合成与统一入口

pub mod dispatcher;
pub mod intent;
pub mod pipeline;
pub mod registry;
pub mod synthesizer;
pub mod types;

pub use dispatcher::{truncate_intents, Dispatcher};
pub use intent::{extract_json, parse_intents, IntentClassifier, IntentParseError};
pub use pipeline::OrchestrationPipeline;
pub use registry::CapabilityRegistry;
pub use synthesizer::{ResponseSynthesizer, NO_ANSWER_REPLY, SYNTHESIS_FAILED_REPLY};
pub use types::{
    AgentResponse, ExecutionPlan, ExecutionStep, Intent, IntentKind, TraceStatus, TraceStep,
    UNHANDLED_CONTENT,
};
