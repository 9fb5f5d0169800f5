//! 身份提供方：OAuth 2.0 授权码流程
//!
//! `IdentityProvider` 三个能力：拼授权 URL、用授权码换令牌、按账户标识静默刷新。
//! `OAuthIdentityProvider` 面向 `{instance}{tenant}/oauth2/v2.0/{authorize,token}` 端点；
//! refresh token 只保存在 Provider 内部（按生成的账户标识索引），缓存层只持有账户引用。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::AuthSection;

/// 一次成功的令牌获取
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub account_id: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// 必须让用户交互式登录（refresh token 失效、需要同意等）
    #[error("Interactive authentication required: {0}")]
    UiRequired(String),

    #[error("Identity provider rejected request: {error} ({description})")]
    Rejected { error: String, description: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    #[error("Identity configuration error: {0}")]
    Config(String),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn authorization_url(&self, state: &str) -> Result<String, IdentityError>;

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, IdentityError>;

    async fn refresh_silently(&self, account_id: &str) -> Result<TokenGrant, IdentityError>;

    /// 丢弃账户对应的 refresh token（登出、重新登录换了账户时调用）
    async fn forget(&self, _account_id: &str) {}
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

/// 需要用户重新交互的 OAuth 错误码
const UI_REQUIRED_ERRORS: &[&str] = &[
    "invalid_grant",
    "interaction_required",
    "login_required",
    "consent_required",
];

fn classify_error(error: String, description: String) -> IdentityError {
    if UI_REQUIRED_ERRORS.contains(&error.as_str()) {
        IdentityError::UiRequired(error)
    } else {
        IdentityError::Rejected { error, description }
    }
}

/// OAuth 授权码 + refresh token 实现
pub struct OAuthIdentityProvider {
    http: reqwest::Client,
    settings: AuthSection,
    /// account_id -> refresh token
    accounts: RwLock<HashMap<String, String>>,
}

impl OAuthIdentityProvider {
    pub fn new(settings: AuthSection) -> Self {
        Self::with_client(reqwest::Client::new(), settings)
    }

    /// 复用已有 HTTP 客户端
    pub fn with_client(http: reqwest::Client, settings: AuthSection) -> Self {
        Self {
            http,
            settings,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!(
            "{}{}/oauth2/v2.0/{}",
            self.settings.instance, self.settings.tenant_id, name
        )
    }

    fn scope(&self) -> String {
        self.settings.scopes.join(" ")
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse, IdentityError> {
        let secret = self.settings.client_secret.as_deref().unwrap_or_default();
        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", secret),
        ];
        params.extend_from_slice(form);

        let response = self
            .http
            .post(self.endpoint("token"))
            .form(&params)
            .send()
            .await
            .map_err(|e| IdentityError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IdentityError::Http(e.to_string()))?;

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| IdentityError::InvalidResponse(e.to_string()))
        } else {
            match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => Err(classify_error(err.error, err.error_description)),
                Err(_) => Err(IdentityError::Http(format!("token endpoint returned {status}"))),
            }
        }
    }

    /// 当前持有 refresh token 的账户数
    pub async fn account_count(&self) -> usize {
        self.accounts.read().await.len()
    }
}

fn to_grant(response: &TokenResponse, account_id: Option<String>) -> Result<TokenGrant, IdentityError> {
    let expires_at = Duration::try_seconds(response.expires_in)
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .ok_or_else(|| {
            IdentityError::InvalidResponse(format!("expires_in out of range: {}", response.expires_in))
        })?;
    Ok(TokenGrant {
        access_token: response.access_token.clone(),
        expires_at,
        account_id,
    })
}

#[async_trait]
impl IdentityProvider for OAuthIdentityProvider {
    fn authorization_url(&self, state: &str) -> Result<String, IdentityError> {
        if self.settings.client_id.is_empty() {
            return Err(IdentityError::Config("auth.client_id is not set".into()));
        }
        let scope = self.scope();
        let url = Url::parse_with_params(
            &self.endpoint("authorize"),
            &[
                ("client_id", self.settings.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.settings.redirect_uri.as_str()),
                ("response_mode", "query"),
                ("scope", scope.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| IdentityError::Config(e.to_string()))?;
        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, IdentityError> {
        let scope = self.scope();
        let response = self
            .request_token(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.settings.redirect_uri.as_str()),
                ("scope", scope.as_str()),
            ])
            .await?;

        let mut grant = to_grant(&response, None)?;
        match &response.refresh_token {
            Some(refresh) => {
                let id = uuid::Uuid::new_v4().to_string();
                self.accounts.write().await.insert(id.clone(), refresh.clone());
                grant.account_id = Some(id);
            }
            None => {
                tracing::warn!("Token response carried no refresh token; silent refresh disabled");
            }
        }
        Ok(grant)
    }

    async fn refresh_silently(&self, account_id: &str) -> Result<TokenGrant, IdentityError> {
        let refresh_token = self
            .accounts
            .read()
            .await
            .get(account_id)
            .cloned()
            .ok_or_else(|| IdentityError::UiRequired("unknown account".into()))?;

        let scope = self.scope();
        let result = self
            .request_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("scope", scope.as_str()),
            ])
            .await;

        match result {
            Ok(response) => {
                let grant = to_grant(&response, Some(account_id.to_string()))?;
                if let Some(rotated) = &response.refresh_token {
                    let mut accounts = self.accounts.write().await;
                    // 刷新期间账户已被登出则不再写回
                    if let Some(slot) = accounts.get_mut(account_id) {
                        *slot = rotated.clone();
                    }
                }
                Ok(grant)
            }
            Err(IdentityError::UiRequired(reason)) => {
                // 失效的 refresh token 不再保留
                self.accounts.write().await.remove(account_id);
                Err(IdentityError::UiRequired(reason))
            }
            Err(other) => Err(other),
        }
    }

    async fn forget(&self, account_id: &str) {
        if self.accounts.write().await.remove(account_id).is_some() {
            tracing::debug!(account_id, "Refresh token discarded");
        }
    }
}
