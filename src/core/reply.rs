//! 错误到用户回复的映射
//!
//! 内部细节（错误消息、会话 ID、堆栈）只写日志，永远不返回给调用方。

use crate::core::OrchestratorError;

pub const EMPTY_MESSAGE_REPLY: &str = "Please enter a message.";
pub const LOGIN_REQUIRED_REPLY: &str =
    "Please log in to access M365 features. Visit the web interface to authenticate.";
pub const TIMEOUT_REPLY: &str =
    "The request timed out. Please try a simpler query or try again later.";
pub const CANCELLED_REPLY: &str = "The request was cancelled.";
pub const GENERIC_ERROR_REPLY: &str =
    "Sorry, an error occurred processing your request. Please try again.";

/// 超长输入的回复，带上限
pub fn too_long_reply(max_len: usize) -> String {
    format!("Message too long. Maximum {max_len} characters allowed.")
}

/// 将 Pipeline 错误映射为固定回复，同时按严重程度记录完整错误
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplyPolicy;

impl ReplyPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn reply_for(&self, err: &OrchestratorError) -> &'static str {
        match err {
            e if e.requires_login() => {
                tracing::info!(error = %e, "login required");
                LOGIN_REQUIRED_REPLY
            }
            OrchestratorError::Timeout { seconds } => {
                tracing::warn!("Request timed out after {} seconds", seconds);
                TIMEOUT_REPLY
            }
            OrchestratorError::Cancelled => {
                tracing::info!("Request cancelled by caller");
                CANCELLED_REPLY
            }
            other => {
                tracing::error!(error = ?other, "Error processing message");
                GENERIC_ERROR_REPLY
            }
        }
    }
}
