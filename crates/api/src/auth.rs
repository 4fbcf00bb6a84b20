//! 认证原语
//!
//! 两条认证通道：用户侧是HMAC签名的短期令牌（承载user_id、任务与
//! 限流配置等声明），处理器侧是共享的静态API密钥。令牌对分发核心
//! 不透明，核心只读取其中少数字段。

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use broker_common::time::now_ms;
use broker_common::types::RateLimitSettings;
use broker_domain::entities::OllamaParams;
use broker_errors::{BrokerError, BrokerResult};

pub const TOKEN_ISSUER: &str = "llm-broker";
pub const TOKEN_AUDIENCE: &str = "llm-broker-api";
pub const BEARER_PREFIX: &str = "Bearer ";

/// 令牌声明集
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ollama_params: Option<OllamaParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSettings>,
}

impl TokenClaims {
    /// user_id缺失时回退到sub
    pub fn resolved_user_id(&self) -> Option<&str> {
        match self.user_id.as_deref() {
            Some(user_id) if !user_id.is_empty() => Some(user_id),
            _ if !self.sub.is_empty() => Some(&self.sub),
            _ => None,
        }
    }
}

/// 用户令牌的可选载荷
#[derive(Debug, Clone, Default)]
pub struct UserTokenSpec {
    pub task_id: Option<String>,
    pub product_data: Option<String>,
    pub priority: Option<i64>,
    pub ollama_params: Option<OllamaParams>,
    pub rate_limit: Option<RateLimitSettings>,
}

/// 令牌签发与校验
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    default_ttl_seconds: i64,
}

impl TokenService {
    pub fn new(secret: &str, default_ttl_seconds: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            default_ttl_seconds,
        }
    }

    pub fn default_ttl_seconds(&self) -> i64 {
        self.default_ttl_seconds
    }

    fn sign(&self, claims: &TokenClaims) -> BrokerResult<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| BrokerError::Internal(format!("令牌签发失败: {e}")))
    }

    /// 签发用户令牌
    pub fn issue_user_token(
        &self,
        user_id: &str,
        spec: UserTokenSpec,
        expires_in_seconds: Option<i64>,
    ) -> BrokerResult<String> {
        let now_secs = now_ms() / 1000;
        let ttl = expires_in_seconds.unwrap_or(self.default_ttl_seconds);

        self.sign(&TokenClaims {
            iss: TOKEN_ISSUER.to_string(),
            aud: Some(TOKEN_AUDIENCE.to_string()),
            sub: user_id.to_string(),
            exp: now_secs + ttl,
            iat: now_secs,
            user_id: Some(user_id.to_string()),
            task_id: spec.task_id,
            product_data: spec.product_data,
            priority: spec.priority,
            ollama_params: spec.ollama_params,
            processor_id: None,
            rate_limit: spec.rate_limit,
        })
    }

    /// 签发结果令牌：只绑定用户与任务，创建任务后返回给调用方
    pub fn issue_result_token(&self, user_id: &str, task_id: &str) -> BrokerResult<String> {
        self.issue_user_token(
            user_id,
            UserTokenSpec {
                task_id: Some(task_id.to_string()),
                ..Default::default()
            },
            None,
        )
    }

    /// 签发处理器令牌
    pub fn issue_processor_token(
        &self,
        processor_id: &str,
        expires_in_seconds: Option<i64>,
    ) -> BrokerResult<String> {
        let now_secs = now_ms() / 1000;
        let ttl = expires_in_seconds.unwrap_or(self.default_ttl_seconds);

        self.sign(&TokenClaims {
            iss: TOKEN_ISSUER.to_string(),
            aud: Some(TOKEN_AUDIENCE.to_string()),
            sub: processor_id.to_string(),
            exp: now_secs + ttl,
            iat: now_secs,
            user_id: None,
            task_id: None,
            product_data: None,
            priority: None,
            ollama_params: None,
            processor_id: Some(processor_id.to_string()),
            rate_limit: None,
        })
    }

    /// 校验签名与过期时间，返回声明集
    pub fn verify(&self, token: &str) -> BrokerResult<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| BrokerError::auth_error(format!("invalid token: {e}")))
    }
}

/// 内部接口共享密钥校验，比较双方的SHA-256摘要
pub struct ApiKeyValidator {
    digest: [u8; 32],
}

impl ApiKeyValidator {
    pub fn new(api_key: &str) -> Self {
        Self {
            digest: Sha256::digest(api_key.as_bytes()).into(),
        }
    }

    pub fn validate(&self, candidate: &str) -> bool {
        let candidate_digest: [u8; 32] = Sha256::digest(candidate.as_bytes()).into();
        candidate_digest == self.digest
    }
}

/// 从`Authorization: Bearer <token>`头里取出令牌
pub fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .filter(|token| !token.is_empty())
}
