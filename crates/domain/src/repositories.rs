//! 领域仓储抽象
//!
//! 定义数据访问的抽象接口。所有状态转换都以带谓词的条件更新表达，
//! 谓词失败返回false而不是错误，由调用方映射为恰当的业务语义。

use async_trait::async_trait;

use crate::entities::{
    PeriodRatingRow, ProcessorLoadRow, ProcessorMetrics, RateLimit, RatingPeriod, RatingTotals,
    StaleTask, Task, TaskBreakdown, TaskFilter, TaskRating, TaskStatus,
};
use broker_errors::BrokerResult;

/// 任务仓储抽象
///
/// 同一用户最多一个活跃任务由`create`原子保证；`pending -> processing`
/// 等状态转换仅通过条件更新发生，并发认领同一任务至多一个成功。
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 创建待处理任务；用户已有活跃任务时返回`ActiveTaskExists`
    async fn create(&self, task: &Task) -> BrokerResult<()>;

    async fn get_by_id(&self, id: &str) -> BrokerResult<Option<Task>>;

    async fn get_latest_by_user(&self, user_id: &str) -> BrokerResult<Option<Task>>;

    async fn list(&self, filter: &TaskFilter) -> BrokerResult<Vec<Task>>;

    /// 待处理页，按(priority DESC, created_at ASC)排序
    async fn pending_page(&self, limit: i64) -> BrokerResult<Vec<Task>>;

    async fn count_pending(&self) -> BrokerResult<i64>;

    /// 条件认领：仅当任务仍为pending时设置所有者与租约，返回是否成功
    async fn try_claim(
        &self,
        id: &str,
        processor_id: &str,
        now: i64,
        timeout_at: i64,
    ) -> BrokerResult<bool>;

    /// 公平认领：一条带pending守卫的事务性批量更新，
    /// 返回更新后实际归属该处理器的任务ID集合（按ID重读，不依赖行序）
    async fn claim_many(
        &self,
        ids: &[String],
        processor_id: &str,
        now: i64,
        timeout_at: i64,
    ) -> BrokerResult<Vec<String>>;

    /// 心跳刷新：仅当任务processing且所有者匹配，返回是否命中
    async fn heartbeat(&self, id: &str, processor_id: &str, now: i64) -> BrokerResult<bool>;

    /// 完成任务。`owner`为Some时附加所有者谓词；终态写入completed_at
    /// 与actual_duration，返回是否命中
    async fn complete(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<&str>,
        error_message: Option<&str>,
        owner: Option<&str>,
        now: i64,
    ) -> BrokerResult<bool>;

    /// 重新入队：processing -> pending，清空所有者与租约，
    /// retry_count加一，返回是否命中
    async fn requeue(
        &self,
        id: &str,
        processor_id: &str,
        reason: Option<&str>,
        now: i64,
    ) -> BrokerResult<bool>;

    /// 心跳早于cutoff（或从未心跳）的进行中任务
    async fn stale_processing(&self, heartbeat_cutoff: i64) -> BrokerResult<Vec<StaleTask>>;

    /// 租约超限且无重试额度的任务直接置为failed
    async fn fail_timed_out(&self, id: &str, error_message: &str, now: i64) -> BrokerResult<bool>;

    /// 可窃取任务：所有者进行中任务数超过阈值、心跳早于cutoff、
    /// 且不属于窃取者，按(owner_active DESC, priority DESC)排序
    async fn steal_candidates(
        &self,
        stealer_id: &str,
        heartbeat_cutoff: i64,
        overload_threshold: i64,
        limit: i64,
    ) -> BrokerResult<Vec<Task>>;

    /// 所有者重指派（状态保持processing），返回实际改写的任务ID
    async fn reassign_owner(
        &self,
        ids: &[String],
        new_owner: &str,
        now: i64,
        timeout_at: i64,
    ) -> BrokerResult<Vec<String>>;

    async fn count_processing_for(&self, processor_id: &str) -> BrokerResult<i64>;

    /// 统计窗口内完成任务的平均处理时长（completed_at - processing_started_at）
    async fn avg_processing_ms_since(&self, cutoff: i64) -> BrokerResult<Option<f64>>;

    /// 清理用的任务存量画像
    async fn status_breakdown(
        &self,
        retention_cutoff: i64,
        heartbeat_cutoff: i64,
    ) -> BrokerResult<TaskBreakdown>;

    /// 删除completed_at早于cutoff的终态任务，返回删除行数
    async fn delete_terminal_before(&self, cutoff: i64) -> BrokerResult<u64>;
}

/// 限流仓储抽象
#[async_trait]
pub trait RateLimitRepository: Send + Sync {
    /// 原子读改写：窗口过期则重置，否则计数加一，upsert后返回最新计数器
    async fn check_and_increment(
        &self,
        user_id: &str,
        window_ms: i64,
        now: i64,
    ) -> BrokerResult<RateLimit>;

    /// 只读快照，无记录时返回零值
    async fn get(&self, user_id: &str) -> BrokerResult<RateLimit>;

    async fn delete_idle_before(&self, cutoff: i64) -> BrokerResult<u64>;

    async fn count(&self) -> BrokerResult<i64>;
}

/// 处理器指标仓储抽象
#[async_trait]
pub trait MetricsRepository: Send + Sync {
    /// 部分字段upsert：未提供的列保留原值，active_tasks与last_updated总是刷新
    async fn upsert(
        &self,
        processor_id: &str,
        cpu_usage: Option<f64>,
        memory_usage: Option<f64>,
        queue_size: Option<i64>,
        active_tasks: i64,
        now: i64,
    ) -> BrokerResult<()>;

    /// last_updated晚于cutoff的有效快照
    async fn list_active(&self, cutoff: i64) -> BrokerResult<Vec<ProcessorMetrics>>;

    /// 有效快照联查活跃任务数，按综合负载升序
    async fn load_ordered(&self, cutoff: i64) -> BrokerResult<Vec<ProcessorLoadRow>>;

    async fn delete_stale_before(&self, cutoff: i64) -> BrokerResult<u64>;
}

/// 评价仓储抽象
///
/// 评价存放在任务行上，但读写路径独立于任务生命周期。
#[async_trait]
pub trait RatingRepository: Send + Sync {
    /// 写评价：任务必须已完成且属于该用户，None表示撤销
    async fn set_rating(
        &self,
        task_id: &str,
        user_id: &str,
        rating: Option<TaskRating>,
        now: i64,
    ) -> BrokerResult<()>;

    /// 全局或按用户过滤的评价汇总
    async fn totals(&self, user_id: Option<&str>) -> BrokerResult<RatingTotals>;

    /// 按小时/天分组的完成任务评价统计
    async fn by_period(&self, period: RatingPeriod, count: i64) -> BrokerResult<Vec<PeriodRatingRow>>;

    /// 最近被评价的已完成任务
    async fn recent_rated(&self, limit: i64) -> BrokerResult<Vec<Task>>;
}
