//! 等待时间估算
//!
//! 基于有效处理器快照与近24小时完成任务的平均处理时长，给出人类
//! 可读的等待区间。没有任何有效处理器时返回保守的高估值。

use std::sync::Arc;

use broker_common::constants::{
    AVG_DURATION_WINDOW_MS, DEFAULT_AVG_DURATION_MS, METRICS_FRESHNESS_MS,
};
use broker_common::time::now_ms;
use broker_domain::repositories::{MetricsRepository, TaskRepository};
use broker_errors::BrokerResult;

pub struct WaitTimeEstimator {
    tasks: Arc<dyn TaskRepository>,
    metrics: Arc<dyn MetricsRepository>,
}

impl WaitTimeEstimator {
    pub fn new(tasks: Arc<dyn TaskRepository>, metrics: Arc<dyn MetricsRepository>) -> Self {
        Self { tasks, metrics }
    }

    /// 新任务的预估等待时间
    pub async fn estimate(&self) -> BrokerResult<String> {
        let now = now_ms();

        let processors = self
            .metrics
            .list_active(now - METRICS_FRESHNESS_MS)
            .await?;
        if processors.is_empty() {
            return Ok("10-15 minutes (no active processors)".to_string());
        }

        let pending = self.tasks.count_pending().await?;
        let avg_ms = self
            .tasks
            .avg_processing_ms_since(now - AVG_DURATION_WINDOW_MS)
            .await?
            .unwrap_or(DEFAULT_AVG_DURATION_MS);

        let total_capacity: f64 = processors.iter().map(|p| p.capacity_factor()).sum();
        let queue_position = (pending as f64 / total_capacity.max(1.0)).ceil();
        let wait_ms = queue_position * avg_ms + avg_ms * 0.5;

        Ok(Self::humanize(wait_ms))
    }

    /// 毫秒估值映射到展示区间
    pub fn humanize(wait_ms: f64) -> String {
        if wait_ms < 10_000.0 {
            return "< 10 seconds".to_string();
        }
        if wait_ms < 30_000.0 {
            return "< 30 seconds".to_string();
        }
        if wait_ms < 60_000.0 {
            return "< 1 minute".to_string();
        }

        let minutes = (wait_ms / 60_000.0).ceil();
        match minutes {
            m if m < 1.0 => "< 1 minute".to_string(),
            m if m <= 2.0 => "1-2 minutes".to_string(),
            m if m <= 5.0 => "2-5 minutes".to_string(),
            m if m <= 10.0 => "5-10 minutes".to_string(),
            m if m <= 15.0 => "10-15 minutes".to_string(),
            m => format!("{m:.0} minutes"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_domain::entities::TaskStatus;
    use broker_testing_utils::{TaskBuilder, TestStore};

    #[test]
    fn test_humanize_buckets() {
        assert_eq!(WaitTimeEstimator::humanize(5_000.0), "< 10 seconds");
        assert_eq!(WaitTimeEstimator::humanize(15_000.0), "< 30 seconds");
        assert_eq!(WaitTimeEstimator::humanize(45_000.0), "< 1 minute");
        assert_eq!(WaitTimeEstimator::humanize(90_000.0), "1-2 minutes");
        assert_eq!(WaitTimeEstimator::humanize(200_000.0), "2-5 minutes");
        assert_eq!(WaitTimeEstimator::humanize(550_000.0), "5-10 minutes");
        assert_eq!(WaitTimeEstimator::humanize(850_000.0), "10-15 minutes");
        assert_eq!(WaitTimeEstimator::humanize(3_600_000.0), "60 minutes");
    }

    #[tokio::test]
    async fn test_no_processors_returns_high_estimate() {
        let store = TestStore::new().await;
        let estimator = WaitTimeEstimator::new(store.tasks.clone(), store.metrics.clone());

        let estimate = estimator.estimate().await.expect("estimate");
        assert_eq!(estimate, "10-15 minutes (no active processors)");
    }

    #[tokio::test]
    async fn test_idle_processor_short_queue() {
        let store = TestStore::new().await;
        let now = now_ms();

        // 一个空载处理器在线
        store
            .metrics
            .upsert("p-1", Some(0.0), Some(0.0), Some(0), 0, now)
            .await
            .expect("metrics");

        // 一个近期完成的任务提供平均时长样本：10秒
        let done = TaskBuilder::new().with_user("u-done").build();
        store.tasks.create(&done).await.expect("create");
        store
            .tasks
            .try_claim(&done.id, "p-1", now - 10_000, now + 300_000)
            .await
            .expect("claim");
        store
            .tasks
            .complete(&done.id, TaskStatus::Completed, Some("r"), None, None, now)
            .await
            .expect("complete");

        // 队列里一个待处理任务
        let pending = TaskBuilder::new().with_user("u-wait").build();
        store.tasks.create(&pending).await.expect("create pending");

        let estimator = WaitTimeEstimator::new(store.tasks.clone(), store.metrics.clone());
        // 等待 = ceil(1/1)·10s + 5s = 15s
        assert_eq!(estimator.estimate().await.expect("estimate"), "< 30 seconds");
    }

    #[tokio::test]
    async fn test_stale_processor_snapshot_ignored() {
        let store = TestStore::new().await;
        let now = now_ms();

        store
            .metrics
            .upsert("p-old", Some(0.0), Some(0.0), Some(0), 0, now - 600_000)
            .await
            .expect("stale metrics");

        let estimator = WaitTimeEstimator::new(store.tasks.clone(), store.metrics.clone());
        assert_eq!(
            estimator.estimate().await.expect("estimate"),
            "10-15 minutes (no active processors)"
        );
    }
}
