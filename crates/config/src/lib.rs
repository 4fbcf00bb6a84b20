//! # 应用配置
//!
//! 配置来源按优先级从低到高：内置默认值、TOML配置文件、`BROKER_`前缀
//! 环境变量（嵌套字段用双下划线分隔，如 `BROKER_SERVER__PORT`）。

pub mod models;

pub use models::{
    AppConfig, AuthConfig, CleanupConfig, DatabaseConfig, RateLimitConfig, ServerConfig,
    StreamConfig,
};

use std::path::Path;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;

use broker_errors::{BrokerError, BrokerResult};

/// 环境变量前缀
pub const ENV_PREFIX: &str = "BROKER_";

impl AppConfig {
    /// 分层加载配置
    pub fn load(config_file: Option<&Path>) -> BrokerResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }

        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| BrokerError::Configuration(e.to_string()))
    }
}
