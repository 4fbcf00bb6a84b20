//! 后台清理
//!
//! 周期性（或按需）回收过期数据：删除超期终态任务，处理心跳失联的
//! 进行中任务（还有额度则重新入队，否则置失败），清理陈旧的限流与
//! 指标记录。每个步骤各自幂等，单个任务出错只记日志不中断整轮。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{error, info, warn};

use broker_common::constants::{HEARTBEAT_STALE_MS, RETENTION_MS};
use broker_common::time::now_ms;
use broker_domain::repositories::{MetricsRepository, RateLimitRepository, TaskRepository};
use broker_errors::BrokerResult;

/// 心跳超时重新入队时写入的原因
const HEARTBEAT_TIMEOUT_REASON: &str = "manager: heartbeat timeout";

/// 重试耗尽时写入的失败原因
const MAX_RETRIES_REASON: &str = "Task failed: heartbeat timeout, max retries reached";

/// 清理服务配置
#[derive(Debug, Clone)]
pub struct CleanupServiceConfig {
    /// 是否启用后台定时清理
    pub enabled: bool,
    /// 定时清理周期（秒）
    pub interval_seconds: u64,
    /// 终态任务与陈旧记录的保留期（毫秒）
    pub retention_ms: i64,
    /// 心跳失联判定阈值（毫秒）
    pub heartbeat_stale_ms: i64,
}

impl Default for CleanupServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
            retention_ms: RETENTION_MS,
            heartbeat_stale_ms: HEARTBEAT_STALE_MS,
        }
    }
}

/// 单轮清理的动作计数
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanedCounts {
    /// 删除的超期终态任务数
    pub tasks: u64,
    /// 重新入队的失联任务数
    pub timedout: u64,
    /// 置为失败的失联任务数
    pub failed: u64,
    /// 删除的限流记录数
    pub rate_limits: u64,
    /// 删除的指标快照数
    pub metrics: u64,
}

/// 清理前的存量画像
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupStats {
    pub total_tasks: i64,
    pub pending_tasks: i64,
    pub processing_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub tasks_older_than_retention: i64,
    pub timedout_tasks: i64,
    pub rate_limit_records: i64,
}

/// 单轮清理结果
#[derive(Debug, Clone, Serialize)]
pub struct CleanupOutcome {
    pub stats: CleanupStats,
    pub cleaned: CleanedCounts,
}

/// 清理服务
pub struct CleanupService {
    tasks: Arc<dyn TaskRepository>,
    rate_limits: Arc<dyn RateLimitRepository>,
    metrics: Arc<dyn MetricsRepository>,
    config: CleanupServiceConfig,
}

impl CleanupService {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        rate_limits: Arc<dyn RateLimitRepository>,
        metrics: Arc<dyn MetricsRepository>,
        config: CleanupServiceConfig,
    ) -> Self {
        Self {
            tasks,
            rate_limits,
            metrics,
            config,
        }
    }

    /// 当前存量画像
    pub async fn stats(&self) -> BrokerResult<CleanupStats> {
        let now = now_ms();
        let breakdown = self
            .tasks
            .status_breakdown(now - self.config.retention_ms, now - self.config.heartbeat_stale_ms)
            .await?;
        let rate_limit_records = self.rate_limits.count().await?;

        Ok(CleanupStats {
            total_tasks: breakdown.total_tasks,
            pending_tasks: breakdown.pending_tasks,
            processing_tasks: breakdown.processing_tasks,
            completed_tasks: breakdown.completed_tasks,
            failed_tasks: breakdown.failed_tasks,
            tasks_older_than_retention: breakdown.tasks_older_than_retention,
            timedout_tasks: breakdown.timed_out_tasks,
            rate_limit_records,
        })
    }

    /// 执行一轮清理
    pub async fn sweep(&self) -> BrokerResult<CleanupOutcome> {
        let now = now_ms();
        let retention_cutoff = now - self.config.retention_ms;
        let heartbeat_cutoff = now - self.config.heartbeat_stale_ms;

        let stats = self.stats().await?;
        let mut cleaned = CleanedCounts::default();

        // 1. 超期终态任务
        match self.tasks.delete_terminal_before(retention_cutoff).await {
            Ok(count) => cleaned.tasks = count,
            Err(e) => error!("删除超期终态任务失败: {}", e),
        }

        // 2. 心跳失联的进行中任务
        match self.tasks.stale_processing(heartbeat_cutoff).await {
            Ok(stale) => {
                for task in stale {
                    if task.retry_count + 1 < task.max_retries {
                        let outcome = match task.processor_id.as_deref() {
                            Some(owner) => {
                                self.tasks
                                    .requeue(&task.id, owner, Some(HEARTBEAT_TIMEOUT_REASON), now)
                                    .await
                            }
                            // 所有者缺失属于异常状态，直接终止任务
                            None => self.tasks.fail_timed_out(&task.id, MAX_RETRIES_REASON, now).await,
                        };
                        match outcome {
                            Ok(true) => {
                                cleaned.timedout += 1;
                                info!(
                                    "任务重新入队: {} (重试 {}/{})",
                                    task.id,
                                    task.retry_count + 1,
                                    task.max_retries
                                );
                            }
                            Ok(false) => {
                                // 并发下任务可能已被完成或重新认领，跳过即可
                            }
                            Err(e) => warn!("任务重新入队失败: {} - {}", task.id, e),
                        }
                    } else {
                        match self.tasks.fail_timed_out(&task.id, MAX_RETRIES_REASON, now).await {
                            Ok(true) => {
                                cleaned.failed += 1;
                                info!("任务因超时置为失败: {} (重试额度耗尽)", task.id);
                            }
                            Ok(false) => {}
                            Err(e) => warn!("任务置失败时出错: {} - {}", task.id, e),
                        }
                    }
                }
            }
            Err(e) => error!("查询失联任务失败: {}", e),
        }

        // 3. 陈旧限流记录
        match self.rate_limits.delete_idle_before(retention_cutoff).await {
            Ok(count) => cleaned.rate_limits = count,
            Err(e) => error!("删除限流记录失败: {}", e),
        }

        // 4. 陈旧指标快照
        match self.metrics.delete_stale_before(retention_cutoff).await {
            Ok(count) => cleaned.metrics = count,
            Err(e) => error!("删除指标快照失败: {}", e),
        }

        info!(
            "清理完成: 任务 {} 条, 重入队 {} 个, 失败 {} 个, 限流 {} 条, 指标 {} 条",
            cleaned.tasks, cleaned.timedout, cleaned.failed, cleaned.rate_limits, cleaned.metrics
        );

        Ok(CleanupOutcome { stats, cleaned })
    }
}

/// 启动后台定时清理，收到关闭信号后退出
pub fn spawn_sweeper(
    service: Arc<CleanupService>,
    config: CleanupServiceConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            info!("后台清理未启用");
            return;
        }

        let mut ticker = interval(Duration::from_secs(config.interval_seconds));
        // 首次tick立即触发，跳过以避免启动即清理
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = service.sweep().await {
                        error!("后台清理失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("后台清理收到关闭信号");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_config_default() {
        let config = CleanupServiceConfig::default();
        assert!(config.enabled);
        assert_eq!(config.interval_seconds, 300);
        assert_eq!(config.retention_ms, 7 * 24 * 60 * 60 * 1000);
        assert_eq!(config.heartbeat_stale_ms, 300_000);
    }

    #[test]
    fn test_cleaned_counts_serialize_shape() {
        let cleaned = CleanedCounts {
            tasks: 2,
            timedout: 1,
            failed: 0,
            rate_limits: 3,
            metrics: 4,
        };
        let json = serde_json::to_value(&cleaned).expect("serialize");
        assert_eq!(json["tasks"], 2);
        assert_eq!(json["timedout"], 1);
        assert_eq!(json["rate_limits"], 3);
    }
}
