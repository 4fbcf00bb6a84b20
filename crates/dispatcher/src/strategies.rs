//! 分发策略
//!
//! 三种由处理器参数选择的认领算法：
//! - 批量认领：逐个条件更新，失败静默跳过；
//! - 公平认领：按负载收缩批大小后一次事务性认领；
//! - 任务窃取：从过载且心跳陈旧的所有者处改挂所有者，状态不变。
//!
//! 排序始终是优先级优先、同优先级FIFO。

use std::sync::Arc;

use tracing::{debug, info};

use broker_common::constants::{
    DEFAULT_CLAIM_BATCH_SIZE, DEFAULT_LEASE_TIMEOUT_MS, DEFAULT_STEAL_COUNT, MAX_CLAIM_BATCH_SIZE,
    MAX_STEAL_COUNT, STEAL_HEARTBEAT_STALE_MS, STEAL_OVERLOAD_THRESHOLD,
};
use broker_common::time::now_ms;
use broker_domain::entities::{Task, TaskStatus};
use broker_domain::repositories::TaskRepository;
use broker_errors::BrokerResult;

/// 认领结果，附带公平分配的说明信息
#[derive(Debug)]
pub struct ClaimOutcome {
    pub tasks: Vec<Task>,
    pub fair_info: Option<String>,
}

pub struct DispatchService {
    tasks: Arc<dyn TaskRepository>,
}

impl DispatchService {
    pub fn new(tasks: Arc<dyn TaskRepository>) -> Self {
        Self { tasks }
    }

    /// 批大小规整到[1, 20]，缺省5
    pub fn normalize_batch_size(batch_size: Option<i64>) -> i64 {
        match batch_size {
            Some(v) if v > 0 && v <= MAX_CLAIM_BATCH_SIZE => v,
            _ => DEFAULT_CLAIM_BATCH_SIZE,
        }
    }

    /// 租约时长缺省5分钟，非正值回退默认
    pub fn normalize_timeout_ms(timeout_ms: Option<i64>) -> i64 {
        match timeout_ms {
            Some(v) if v > 0 => v,
            _ => DEFAULT_LEASE_TIMEOUT_MS,
        }
    }

    /// 窃取数量规整到[1, 5]，缺省2
    pub fn normalize_steal_count(max_steal: Option<i64>) -> i64 {
        match max_steal {
            Some(v) if v > 0 && v <= MAX_STEAL_COUNT => v,
            _ => DEFAULT_STEAL_COUNT,
        }
    }

    /// 负载收缩后的批大小：ceil(batch · (1 − load·0.5))，下限1
    pub fn adjusted_batch_size(batch_size: i64, processor_load: f64) -> i64 {
        let load = processor_load.clamp(0.0, 1.0);
        ((batch_size as f64) * (1.0 - load * 0.5)).ceil().max(1.0) as i64
    }

    /// 批量认领
    pub async fn claim_batch(
        &self,
        processor_id: &str,
        batch_size: Option<i64>,
        timeout_ms: Option<i64>,
    ) -> BrokerResult<Vec<Task>> {
        let batch_size = Self::normalize_batch_size(batch_size);
        let timeout_ms = Self::normalize_timeout_ms(timeout_ms);

        let pending = self.tasks.pending_page(batch_size).await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let now = now_ms();
        let timeout_at = now + timeout_ms;
        let mut claimed = Vec::new();

        for mut task in pending {
            // 输掉竞争的任务静默跳过
            match self
                .tasks
                .try_claim(&task.id, processor_id, now, timeout_at)
                .await
            {
                Ok(true) => {
                    apply_claim_fields(&mut task, processor_id, now, timeout_at);
                    claimed.push(task);
                }
                Ok(false) => continue,
                Err(e) => {
                    debug!("认领任务 {} 失败: {}", task.id, e);
                    continue;
                }
            }
        }

        for task in &claimed {
            info!("[CLAIM] 任务 {} (user {}) 分派给处理器 {}", task.id, task.user_id, processor_id);
        }
        Ok(claimed)
    }

    /// 公平认领：负载感知收缩批大小，单事务认领选中集
    pub async fn claim_fair(
        &self,
        processor_id: &str,
        batch_size: Option<i64>,
        processor_load: f64,
        timeout_ms: Option<i64>,
    ) -> BrokerResult<ClaimOutcome> {
        let batch_size = Self::normalize_batch_size(batch_size);
        let timeout_ms = Self::normalize_timeout_ms(timeout_ms);
        let adjusted = Self::adjusted_batch_size(batch_size, processor_load);

        let selected = self.tasks.pending_page(adjusted).await?;
        if selected.is_empty() {
            return Ok(ClaimOutcome {
                tasks: Vec::new(),
                fair_info: Some(format!(
                    "Load: {processor_load:.1}, Adjusted batch size: {adjusted}, No tasks available"
                )),
            });
        }

        let now = now_ms();
        let timeout_at = now + timeout_ms;
        let ids: Vec<String> = selected.iter().map(|t| t.id.clone()).collect();
        let claimed_ids = self
            .tasks
            .claim_many(&ids, processor_id, now, timeout_at)
            .await?;

        let tasks: Vec<Task> = selected
            .into_iter()
            .filter(|task| claimed_ids.contains(&task.id))
            .map(|mut task| {
                apply_claim_fields(&mut task, processor_id, now, timeout_at);
                task
            })
            .collect();

        let fair_info = format!(
            "Load: {processor_load:.1}, Adjusted batch size: {adjusted}, Claimed: {}",
            tasks.len()
        );
        info!("[FAIR-CLAIM] 处理器 {}: {}", processor_id, fair_info);

        Ok(ClaimOutcome {
            tasks,
            fair_info: Some(fair_info),
        })
    }

    /// 任务窃取：只从过载且心跳陈旧的所有者处转移，状态保持processing
    pub async fn steal_work(
        &self,
        stealer_id: &str,
        max_steal: Option<i64>,
        timeout_ms: Option<i64>,
    ) -> BrokerResult<Vec<Task>> {
        let max_steal = Self::normalize_steal_count(max_steal);
        let timeout_ms = Self::normalize_timeout_ms(timeout_ms);
        let now = now_ms();

        let candidates = self
            .tasks
            .steal_candidates(
                stealer_id,
                now - STEAL_HEARTBEAT_STALE_MS,
                STEAL_OVERLOAD_THRESHOLD,
                max_steal,
            )
            .await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let timeout_at = now + timeout_ms;
        let ids: Vec<String> = candidates.iter().map(|t| t.id.clone()).collect();
        let stolen_ids = self
            .tasks
            .reassign_owner(&ids, stealer_id, now, timeout_at)
            .await?;

        let stolen: Vec<Task> = candidates
            .into_iter()
            .filter(|task| stolen_ids.contains(&task.id))
            .map(|mut task| {
                task.processor_id = Some(stealer_id.to_string());
                task.heartbeat_at = Some(now);
                task.timeout_at = Some(timeout_at);
                task.updated_at = now;
                task
            })
            .collect();

        if !stolen.is_empty() {
            info!("[WORK-STEAL] 处理器 {} 窃取了 {} 个任务", stealer_id, stolen.len());
        }
        Ok(stolen)
    }
}

fn apply_claim_fields(task: &mut Task, processor_id: &str, now: i64, timeout_at: i64) {
    task.status = TaskStatus::Processing;
    task.processor_id = Some(processor_id.to_string());
    task.processing_started_at = Some(now);
    task.heartbeat_at = Some(now);
    task.timeout_at = Some(timeout_at);
    task.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_normalization() {
        assert_eq!(DispatchService::normalize_batch_size(None), 5);
        assert_eq!(DispatchService::normalize_batch_size(Some(0)), 5);
        assert_eq!(DispatchService::normalize_batch_size(Some(-3)), 5);
        assert_eq!(DispatchService::normalize_batch_size(Some(21)), 5);
        assert_eq!(DispatchService::normalize_batch_size(Some(20)), 20);
        assert_eq!(DispatchService::normalize_batch_size(Some(1)), 1);
    }

    #[test]
    fn test_steal_count_normalization() {
        assert_eq!(DispatchService::normalize_steal_count(None), 2);
        assert_eq!(DispatchService::normalize_steal_count(Some(0)), 2);
        assert_eq!(DispatchService::normalize_steal_count(Some(6)), 2);
        assert_eq!(DispatchService::normalize_steal_count(Some(5)), 5);
    }

    #[test]
    fn test_adjusted_batch_size_load_curve() {
        // 空载不收缩
        assert_eq!(DispatchService::adjusted_batch_size(10, 0.0), 10);
        // 半载收缩到3/4
        assert_eq!(DispatchService::adjusted_batch_size(10, 0.5), 8);
        // 满载减半
        assert_eq!(DispatchService::adjusted_batch_size(10, 1.0), 5);
        // 满载且批大小为1时保底1
        assert_eq!(DispatchService::adjusted_batch_size(1, 1.0), 1);
        // 越界负载被收拢
        assert_eq!(DispatchService::adjusted_batch_size(10, 7.0), 5);
        assert_eq!(DispatchService::adjusted_batch_size(10, -1.0), 10);
    }
}
