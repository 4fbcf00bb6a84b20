//! 准入限流
//!
//! 任务创建前的滑动窗口配额检查。计数先加后判：第max次请求仍然
//! 放行，严格超过上限才拒绝。窗口与上限可由令牌携带的自定义配置
//! 覆盖系统默认值。

use std::sync::Arc;

use tracing::warn;

use broker_common::time::now_ms;
use broker_common::types::RateLimitSettings;
use broker_domain::entities::RateLimit;
use broker_domain::repositories::RateLimitRepository;
use broker_errors::{BrokerError, BrokerResult};

pub struct AdmissionService {
    rate_limits: Arc<dyn RateLimitRepository>,
    defaults: RateLimitSettings,
}

impl AdmissionService {
    pub fn new(rate_limits: Arc<dyn RateLimitRepository>, defaults: RateLimitSettings) -> Self {
        Self {
            rate_limits,
            defaults,
        }
    }

    /// 记入一次请求并检查配额，超限返回`RateLimited`
    pub async fn check_quota(
        &self,
        user_id: &str,
        override_settings: Option<RateLimitSettings>,
    ) -> BrokerResult<RateLimit> {
        let settings = override_settings.unwrap_or(self.defaults);
        let counter = self
            .rate_limits
            .check_and_increment(user_id, settings.window_ms, now_ms())
            .await?;

        if counter.request_count > settings.max_requests {
            warn!(
                "用户 {} 超出配额: {} 次请求 (上限 {}, 窗口 {}ms)",
                user_id, counter.request_count, settings.max_requests, settings.window_ms
            );
            return Err(BrokerError::rate_limited(user_id));
        }

        Ok(counter)
    }

    pub fn defaults(&self) -> RateLimitSettings {
        self.defaults
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_testing_utils::TestStore;

    #[tokio::test]
    async fn test_nth_request_passes_nth_plus_one_rejected() {
        let store = TestStore::new().await;
        let service = AdmissionService::new(
            store.rate_limits.clone(),
            RateLimitSettings {
                max_requests: 3,
                window_ms: 60_000,
            },
        );

        for i in 1..=3 {
            let counter = service.check_quota("u-1", None).await.expect("within quota");
            assert_eq!(counter.request_count, i);
        }

        match service.check_quota("u-1", None).await {
            Err(BrokerError::RateLimited { user_id }) => assert_eq!(user_id, "u-1"),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_token_override_takes_precedence() {
        let store = TestStore::new().await;
        let service = AdmissionService::new(
            store.rate_limits.clone(),
            RateLimitSettings {
                max_requests: 100,
                window_ms: 60_000,
            },
        );

        let tight = RateLimitSettings {
            max_requests: 1,
            window_ms: 60_000,
        };
        service
            .check_quota("u-1", Some(tight))
            .await
            .expect("first passes");
        assert!(service.check_quota("u-1", Some(tight)).await.is_err());

        // 其他用户不受影响
        service
            .check_quota("u-2", Some(tight))
            .await
            .expect("separate counter");
    }
}
