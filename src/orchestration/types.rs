//! 编排数据模型：意图类型、意图、能力响应、执行计划与追踪步骤

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 意图类型（闭集 + Unknown）
///
/// 线上名沿用分类 Prompt 中的写法（`M365Email` 等），反序列化大小写不敏感；
/// 分类器给出的未知名字保留为 `Unknown`，由 Dispatcher 生成「无法处理」的响应。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IntentKind {
    Email,
    Calendar,
    Files,
    People,
    GeneralKnowledge,
    Unknown(String),
}

impl IntentKind {
    /// 可注册能力的已知类型
    pub const KNOWN: [IntentKind; 5] = [
        IntentKind::Email,
        IntentKind::Calendar,
        IntentKind::Files,
        IntentKind::People,
        IntentKind::GeneralKnowledge,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            IntentKind::Email => "M365Email",
            IntentKind::Calendar => "M365Calendar",
            IntentKind::Files => "M365Files",
            IntentKind::People => "M365People",
            IntentKind::GeneralKnowledge => "GeneralKnowledge",
            IntentKind::Unknown(name) => name,
        }
    }

    /// 是否针对用户个人数据（需要委托令牌）
    pub fn needs_credential(&self) -> bool {
        matches!(
            self,
            IntentKind::Email | IntentKind::Calendar | IntentKind::Files | IntentKind::People
        )
    }
}

impl From<String> for IntentKind {
    fn from(name: String) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "m365email" => IntentKind::Email,
            "m365calendar" => IntentKind::Calendar,
            "m365files" => IntentKind::Files,
            "m365people" => IntentKind::People,
            "generalknowledge" | "general" => IntentKind::GeneralKnowledge,
            _ => IntentKind::Unknown(name),
        }
    }
}

impl From<IntentKind> for String {
    fn from(kind: IntentKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 分类出的子请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(rename = "type", alias = "kind")]
    pub kind: IntentKind,
    #[serde(default)]
    pub query: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_confidence() -> f32 {
    1.0
}

impl Intent {
    pub fn new(kind: IntentKind, query: impl Into<String>) -> Self {
        Self {
            kind,
            query: query.into(),
            confidence: default_confidence(),
        }
    }

    /// 分类失败时的兜底意图
    pub fn general(query: impl Into<String>) -> Self {
        Self::new(IntentKind::GeneralKnowledge, query)
    }

    pub fn needs_credential(&self) -> bool {
        self.kind.needs_credential()
    }
}

/// 单个意图的执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub source: String,
    pub kind: IntentKind,
    pub content: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

pub const UNHANDLED_CONTENT: &str = "I'm not sure how to handle that request.";

impl AgentResponse {
    pub fn success(source: impl Into<String>, kind: IntentKind, content: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind,
            content: content.into(),
            success: true,
            error: None,
            metadata: None,
        }
    }

    /// 分支失败：content 固定为 `Error: <message>`
    pub fn failure(source: impl Into<String>, kind: IntentKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            source: source.into(),
            kind,
            content: format!("Error: {message}"),
            success: false,
            error: Some(message),
            metadata: None,
        }
    }

    /// 没有能力可处理该意图
    pub fn unhandled(kind: IntentKind) -> Self {
        Self {
            source: "unknown".to_string(),
            kind,
            content: UNHANDLED_CONTENT.to_string(),
            success: false,
            error: Some("no capability registered".to_string()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// 即将执行的步骤快照，仅用于追踪
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub steps: Vec<ExecutionStep>,
    pub parallel: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStep {
    pub step_id: usize,
    pub capability: String,
    pub intent: Intent,
}

impl ExecutionPlan {
    pub fn new(steps: Vec<ExecutionStep>, parallel: bool) -> Self {
        Self {
            plan_id: uuid::Uuid::new_v4().to_string(),
            steps,
            parallel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Started,
    Completed,
    Failed,
}

/// 分支追踪记录
#[derive(Debug, Clone, Serialize)]
pub struct TraceStep {
    pub step_id: usize,
    pub source: String,
    pub action: String,
    pub status: TraceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TraceStep {
    pub fn started(step_id: usize, source: &str, action: &IntentKind) -> Self {
        Self {
            step_id,
            source: source.to_string(),
            action: action.to_string(),
            status: TraceStatus::Started,
            duration_ms: None,
            error: None,
        }
    }

    pub fn finish(self, duration_ms: u64, error: Option<String>) -> Self {
        Self {
            status: if error.is_some() {
                TraceStatus::Failed
            } else {
                TraceStatus::Completed
            },
            duration_ms: Some(duration_ms),
            error,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_kind_parses_case_insensitive() {
        assert_eq!(IntentKind::from("m365calendar".to_string()), IntentKind::Calendar);
        assert_eq!(IntentKind::from("GeneralKnowledge".to_string()), IntentKind::GeneralKnowledge);
        assert_eq!(
            IntentKind::from("Weather".to_string()),
            IntentKind::Unknown("Weather".to_string())
        );
    }

    #[test]
    fn test_intent_deserializes_with_defaults() {
        let intent: Intent =
            serde_json::from_str(r#"{"type":"M365Email","query":"unread mail"}"#).unwrap();
        assert_eq!(intent.kind, IntentKind::Email);
        assert_eq!(intent.confidence, 1.0);
        assert!(intent.needs_credential());

        let aliased: Intent = serde_json::from_str(r#"{"kind":"GeneralKnowledge","query":"q"}"#).unwrap();
        assert_eq!(aliased.kind, IntentKind::GeneralKnowledge);
        assert!(!aliased.needs_credential());
    }

    #[test]
    fn test_failure_response_shape() {
        let r = AgentResponse::failure("llm_knowledge", IntentKind::GeneralKnowledge, "boom");
        assert!(!r.success);
        assert_eq!(r.content, "Error: boom");
        assert_eq!(r.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_trace_step_finish() {
        let step = TraceStep::started(0, "m365_copilot", &IntentKind::Calendar);
        assert_eq!(step.status, TraceStatus::Started);
        let done = step.clone().finish(12, None);
        assert_eq!(done.status, TraceStatus::Completed);
        assert_eq!(done.duration_ms, Some(12));
        let failed = step.finish(5, Some("x".into()));
        assert_eq!(failed.status, TraceStatus::Failed);
    }
}
