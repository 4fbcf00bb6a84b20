//! # 共享类型定义

use serde::{Deserialize, Serialize};

/// 任务ID类型（UUID文本形式）
pub type TaskId = String;

/// 用户ID类型
pub type UserId = String;

/// 处理器ID类型
pub type ProcessorId = String;

/// 毫秒时间戳类型
pub type EpochMs = i64;

/// 限流自定义配置，可由令牌携带覆盖系统默认值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub max_requests: i64,
    pub window_ms: i64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: crate::constants::DEFAULT_RATE_MAX_REQUESTS,
            window_ms: crate::constants::DEFAULT_RATE_WINDOW_MS,
        }
    }
}

/// 将取值收拢到[min, max]区间，非法输入回退默认值
pub fn clamp_param(value: Option<u64>, default: u64, min: u64, max: u64) -> u64 {
    match value {
        Some(v) => v.clamp(min, max),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_param_bounds() {
        assert_eq!(clamp_param(None, 2000, 1000, 10000), 2000);
        assert_eq!(clamp_param(Some(500), 2000, 1000, 10000), 1000);
        assert_eq!(clamp_param(Some(50_000), 2000, 1000, 10000), 10000);
        assert_eq!(clamp_param(Some(3000), 2000, 1000, 10000), 3000);
    }

    #[test]
    fn test_rate_limit_settings_default() {
        let settings = RateLimitSettings::default();
        assert_eq!(settings.max_requests, 100);
        assert_eq!(settings.window_ms, 86_400_000);
    }
}
