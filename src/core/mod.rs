//! 核心：错误类型与错误到用户回复的映射

pub mod error;
pub mod reply;

pub use error::OrchestratorError;
pub use reply::ReplyPolicy;
