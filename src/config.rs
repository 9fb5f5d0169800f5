//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONCIERGE__*` 覆盖（双下划线表示嵌套，如 `CONCIERGE__ORCHESTRATION__MAX_AGENT_CALLS=3`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub orchestration: OrchestrationSettings,
    pub llm: LlmSection,
    pub auth: AuthSection,
    pub graph: GraphSection,
    pub server: ServerSection,
}

/// [orchestration] 段：调度上限、总超时、是否并行
///
/// 运行期只读；构建 Pipeline 前先经过 [`OrchestrationSettings::validated`]。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestrationSettings {
    /// 单次请求最多执行的意图数，超出部分直接丢弃
    pub max_agent_calls: usize,
    /// 整个请求（分类 + 调度 + 合成）共享的超时（秒）
    pub timeout_seconds: u64,
    pub enable_parallel_execution: bool,
    /// 用户输入最大字符数
    pub max_message_length: usize,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            max_agent_calls: 5,
            timeout_seconds: 30,
            enable_parallel_execution: true,
            max_message_length: 4000,
        }
    }
}

impl OrchestrationSettings {
    /// 修正非法值：max_agent_calls 至少 1，timeout_seconds 至少 1，max_message_length 至少 1
    pub fn validated(mut self) -> Self {
        if self.max_agent_calls == 0 {
            tracing::warn!("orchestration.max_agent_calls = 0 is invalid, using 1");
            self.max_agent_calls = 1;
        }
        if self.timeout_seconds == 0 {
            tracing::warn!("orchestration.timeout_seconds = 0 is invalid, using 1");
            self.timeout_seconds = 1;
        }
        if self.max_message_length == 0 {
            self.max_message_length = OrchestrationSettings::default().max_message_length;
        }
        self
    }
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai；优先级由 API Key 与 provider 共同决定
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub deepseek: LlmModelSection,
    pub openai: LlmModelSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            deepseek: LlmModelSection::default(),
            openai: LlmModelSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmModelSection {
    pub model: Option<String>,
}

/// [auth] 段：OAuth 授权码流程与令牌缓存
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// 授权服务根地址（含末尾斜杠），如 https://login.microsoftonline.com/
    pub instance: String,
    pub tenant_id: String,
    pub client_id: String,
    /// 建议通过 CONCIERGE__AUTH__CLIENT_SECRET 注入，不写入文件
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// 距离过期多少秒内视为需要静默刷新
    pub refresh_skew_secs: i64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            instance: "https://login.microsoftonline.com/".to_string(),
            tenant_id: "common".to_string(),
            client_id: String::new(),
            client_secret: None,
            redirect_uri: "http://localhost:5000/auth/callback".to_string(),
            scopes: default_scopes(),
            refresh_skew_secs: 300,
        }
    }
}

fn default_scopes() -> Vec<String> {
    [
        "openid",
        "profile",
        "offline_access",
        "User.Read",
        "Mail.Read",
        "Calendars.Read",
        "Files.Read.All",
        "Sites.Read.All",
        "People.Read.All",
        "Chat.Read",
        "OnlineMeetingTranscript.Read.All",
        "ChannelMessage.Read.All",
        "ExternalItem.Read.All",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// [graph] 段：Copilot Chat API
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphSection {
    pub base_url: String,
    /// 传给 Copilot 的 locationHint.timeZone
    pub time_zone: String,
    /// 单次 HTTP 请求超时（秒）；整体仍受 orchestration.timeout_seconds 约束
    pub request_timeout_secs: u64,
}

impl Default for GraphSection {
    fn default() -> Self {
        Self {
            base_url: "https://graph.microsoft.com/beta".to_string(),
            time_zone: "America/Los_Angeles".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// [server] 段：Web 入口监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 CONCIERGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONCIERGE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONCIERGE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_orchestration_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestration.max_agent_calls, 5);
        assert_eq!(cfg.orchestration.timeout_seconds, 30);
        assert!(cfg.orchestration.enable_parallel_execution);
        assert_eq!(cfg.orchestration.max_message_length, 4000);
        assert_eq!(cfg.auth.refresh_skew_secs, 300);
    }

    #[test]
    fn test_validated_clamps_zero_values() {
        let settings = OrchestrationSettings {
            max_agent_calls: 0,
            timeout_seconds: 0,
            enable_parallel_execution: false,
            max_message_length: 0,
        }
        .validated();
        assert_eq!(settings.max_agent_calls, 1);
        assert_eq!(settings.timeout_seconds, 1);
        assert_eq!(settings.max_message_length, 4000);
        assert!(!settings.enable_parallel_execution);
    }

    #[test]
    fn test_load_config_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[orchestration]\nmax_agent_calls = 2\ntimeout_seconds = 90\nenable_parallel_execution = false\n\n[graph]\ntime_zone = \"Asia/Shanghai\""
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.orchestration.max_agent_calls, 2);
        assert_eq!(cfg.orchestration.timeout_seconds, 90);
        assert!(!cfg.orchestration.enable_parallel_execution);
        // 未写的键保持默认
        assert_eq!(cfg.orchestration.max_message_length, 4000);
        assert_eq!(cfg.graph.time_zone, "Asia/Shanghai");
    }
}
