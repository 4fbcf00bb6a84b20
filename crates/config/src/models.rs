//! 配置模型定义

use serde::{Deserialize, Serialize};

/// 应用总配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub cleanup: CleanupConfig,
    pub stream: StreamConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cleanup: CleanupConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

/// HTTP服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite数据库文件路径
    pub path: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/llm-broker.db".to_string(),
            max_connections: 5,
            min_connections: 1,
            connection_timeout_seconds: 30,
        }
    }
}

/// 认证配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC签名密钥
    pub jwt_secret: String,
    /// 处理器内部接口共享密钥
    pub internal_api_key: String,
    /// 令牌默认有效期（秒）
    pub token_ttl_seconds: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "dev-secret-key".to_string(),
            internal_api_key: "dev-internal-key".to_string(),
            token_ttl_seconds: 3600,
        }
    }
}

/// 限流配置（令牌未携带自定义配置时的默认值）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window_ms: i64,
    pub max_requests: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 86_400_000,
            max_requests: 100,
        }
    }
}

/// 后台清理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// 清理周期（秒）
    pub interval_seconds: u64,
    /// 终态任务保留天数
    pub retention_days: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
            retention_days: 7,
        }
    }
}

/// 事件流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// 订阅者邮箱容量
    pub mailbox_capacity: usize,
    /// 协议层keepalive注释间隔（秒）
    pub keepalive_seconds: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 10,
            keepalive_seconds: 25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address() {
        let server = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 3000,
        };
        assert_eq!(server.bind_address(), "127.0.0.1:3000");
    }

    #[test]
    fn test_cleanup_defaults() {
        let cleanup = CleanupConfig::default();
        assert!(cleanup.enabled);
        assert_eq!(cleanup.retention_days, 7);
    }
}
