//! 认证层：会话令牌缓存、身份提供方、登录流程

pub mod flow;
pub mod identity;
pub mod token_cache;

pub use flow::{AuthFlow, AuthFlowError};
pub use identity::{IdentityError, IdentityProvider, OAuthIdentityProvider, TokenGrant};
pub use token_cache::{
    CachedCredential, CredentialState, InMemoryTokenCache, TokenCache, TokenCacheError,
};
