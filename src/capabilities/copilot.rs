//! Microsoft 365 Copilot Chat 能力
//!
//! 两步：`POST /copilot/conversations` 建会话，再 `POST /copilot/conversations/{id}/chat` 发问题，
//! 取返回消息列表的最后一条文本。邮件 / 日历 / 文件 / 人员四类意图各注册一个实例，共享同一个 HTTP 客户端。
//! 401 → Unauthorized（向上冒泡触发登录提示），403 → Forbidden，404 / 5xx → Unavailable。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::capabilities::{Capability, CapabilityError};
use crate::config::GraphSection;

pub const NO_COPILOT_RESPONSE: &str = "No response received from Copilot.";

/// 只允许把令牌发往 Graph 主机
const ALLOWED_HOSTS: &[&str] = &["graph.microsoft.com", "graph.microsoft-ppe.com"];

#[derive(Debug, Deserialize)]
struct Conversation {
    id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest<'a> {
    message: ChatText<'a>,
    location_hint: LocationHint<'a>,
}

#[derive(Debug, Serialize)]
struct ChatText<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LocationHint<'a> {
    time_zone: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    text: Option<String>,
}

#[derive(Clone)]
pub struct CopilotCapability {
    http: reqwest::Client,
    base_url: String,
    time_zone: String,
    /// 日志用的领域标签（email / calendar / files / people）
    domain: &'static str,
}

impl CopilotCapability {
    pub fn new(settings: &GraphSection, domain: &'static str) -> Result<Self, CapabilityError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| CapabilityError::Failed(e.to_string()))?;
        Ok(Self::with_client(http, settings, domain))
    }

    /// 复用已有 HTTP 客户端
    pub fn with_client(http: reqwest::Client, settings: &GraphSection, domain: &'static str) -> Self {
        Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            time_zone: settings.time_zone.clone(),
            domain,
        }
    }

    fn check_host(&self) -> Result<(), CapabilityError> {
        let url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| CapabilityError::Failed(format!("invalid graph.base_url: {e}")))?;
        match url.host_str() {
            Some(host) if ALLOWED_HOSTS.contains(&host) => Ok(()),
            other => Err(CapabilityError::Failed(format!(
                "refusing to send token to host {:?}",
                other
            ))),
        }
    }

    async fn chat(&self, query: &str, token: &str) -> Result<String, CapabilityError> {
        tracing::info!(domain = self.domain, "Creating Copilot conversation");
        let response = self
            .http
            .post(format!("{}/copilot/conversations", self.base_url))
            .bearer_auth(token)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        let conversation: Conversation = parse_json(response).await?;
        let conversation_id = conversation.id.ok_or_else(|| {
            CapabilityError::Failed("Failed to create conversation - no ID returned".into())
        })?;

        tracing::debug!(domain = self.domain, %conversation_id, "Sending chat message");
        let body = ChatRequest {
            message: ChatText { text: query },
            location_hint: LocationHint {
                time_zone: &self.time_zone,
            },
        };
        let response = self
            .http
            .post(format!(
                "{}/copilot/conversations/{}/chat",
                self.base_url, conversation_id
            ))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        let chat: ChatResponse = parse_json(response).await?;

        Ok(last_message_text(chat))
    }
}

/// HTTP 状态码到能力错误；成功返回 None
fn map_status(status: StatusCode) -> Option<CapabilityError> {
    match status {
        s if s.is_success() => None,
        StatusCode::UNAUTHORIZED => Some(CapabilityError::Unauthorized(
            "token may be expired or invalid".into(),
        )),
        StatusCode::FORBIDDEN => Some(CapabilityError::Forbidden(
            "user may lack a Copilot license".into(),
        )),
        StatusCode::NOT_FOUND => Some(CapabilityError::Unavailable(
            "Copilot endpoint not available".into(),
        )),
        s if s.is_server_error() => Some(CapabilityError::Unavailable(format!(
            "Copilot service returned {s}"
        ))),
        s => Some(CapabilityError::Failed(format!("Copilot API returned {s}"))),
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, CapabilityError> {
    if let Some(err) = map_status(response.status()) {
        return Err(err);
    }
    response
        .json::<T>()
        .await
        .map_err(|e| CapabilityError::Failed(format!("invalid Copilot response: {e}")))
}

fn last_message_text(chat: ChatResponse) -> String {
    match chat.messages.last() {
        None => {
            tracing::warn!("No messages in Copilot response");
            NO_COPILOT_RESPONSE.to_string()
        }
        Some(m) => m
            .text
            .clone()
            .unwrap_or_else(|| "No response content.".to_string()),
    }
}

#[async_trait]
impl Capability for CopilotCapability {
    fn name(&self) -> &str {
        "m365_copilot"
    }

    fn requires_credential(&self) -> bool {
        true
    }

    async fn answer(
        &self,
        query: &str,
        credential: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, CapabilityError> {
        let token = credential
            .ok_or_else(|| CapabilityError::Unauthorized("no delegated credential".into()))?;
        self.check_host()?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CapabilityError::Cancelled),
            result = self.chat(query, token) => {
                if let Err(e) = &result {
                    tracing::error!(domain = self.domain, error = %e, "Error calling Copilot Chat API");
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status() {
        assert_eq!(map_status(StatusCode::OK), None);
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED),
            Some(CapabilityError::Unauthorized(_))
        ));
        assert!(matches!(
            map_status(StatusCode::FORBIDDEN),
            Some(CapabilityError::Forbidden(_))
        ));
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND),
            Some(CapabilityError::Unavailable(_))
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY),
            Some(CapabilityError::Unavailable(_))
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST),
            Some(CapabilityError::Failed(_))
        ));
    }

    #[test]
    fn test_last_message_text() {
        let chat: ChatResponse = serde_json::from_str(
            r#"{"messages":[{"text":"question echo"},{"text":"You have 2 meetings."}]}"#,
        )
        .unwrap();
        assert_eq!(last_message_text(chat), "You have 2 meetings.");

        let empty: ChatResponse = serde_json::from_str(r#"{"messages":[]}"#).unwrap();
        assert_eq!(last_message_text(empty), NO_COPILOT_RESPONSE);
    }

    #[test]
    fn test_chat_request_shape() {
        let body = ChatRequest {
            message: ChatText { text: "hi" },
            location_hint: LocationHint {
                time_zone: "UTC",
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["message"]["text"], "hi");
        assert_eq!(json["locationHint"]["timeZone"], "UTC");
    }

    #[tokio::test]
    async fn test_missing_credential_is_unauthorized() {
        let cap = CopilotCapability::new(&GraphSection::default(), "calendar").unwrap();
        assert!(cap.requires_credential());
        let err = cap
            .answer("meetings?", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_token_not_sent_to_foreign_host() {
        let settings = GraphSection {
            base_url: "https://evil.example.com/beta".into(),
            ..GraphSection::default()
        };
        let cap = CopilotCapability::new(&settings, "email").unwrap();
        let err = cap
            .answer("q", Some("secret"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Failed(_)));
    }
}
