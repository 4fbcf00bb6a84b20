//! # 系统常量定义
//!
//! 包含任务分发系统的默认值与边界值定义

/// 系统名称
pub const SYSTEM_NAME: &str = "llm-broker";

/// 系统版本
pub const SYSTEM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 默认任务租约时长（毫秒）
pub const DEFAULT_LEASE_TIMEOUT_MS: i64 = 300_000;

/// 任务心跳过期阈值（毫秒），超过后任务被视为失联
pub const HEARTBEAT_STALE_MS: i64 = 300_000;

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// 批量认领默认批大小
pub const DEFAULT_CLAIM_BATCH_SIZE: i64 = 5;

/// 批量认领批大小上限
pub const MAX_CLAIM_BATCH_SIZE: i64 = 20;

/// 任务窃取默认数量
pub const DEFAULT_STEAL_COUNT: i64 = 2;

/// 任务窃取数量上限
pub const MAX_STEAL_COUNT: i64 = 5;

/// 可被窃取任务的心跳陈旧阈值（毫秒）
pub const STEAL_HEARTBEAT_STALE_MS: i64 = 60_000;

/// 处理器过载判定：进行中任务数超过该值才允许被窃取
pub const STEAL_OVERLOAD_THRESHOLD: i64 = 5;

/// 限流默认窗口（毫秒，24小时）
pub const DEFAULT_RATE_WINDOW_MS: i64 = 86_400_000;

/// 限流默认请求上限
pub const DEFAULT_RATE_MAX_REQUESTS: i64 = 100;

/// 处理器指标有效期（毫秒），更旧的快照不参与估算
pub const METRICS_FRESHNESS_MS: i64 = 300_000;

/// 终态任务、限流记录、指标快照的保留期（毫秒，7天）
pub const RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// 平均处理时长的统计窗口（毫秒，24小时）
pub const AVG_DURATION_WINDOW_MS: i64 = 86_400_000;

/// 没有完成样本时的默认平均处理时长（毫秒）
pub const DEFAULT_AVG_DURATION_MS: f64 = 45_000.0;

/// 事件订阅者邮箱容量
pub const SUBSCRIBER_MAILBOX_CAPACITY: usize = 10;

/// 用户结果流轮询间隔默认值与边界（毫秒）
pub const POLL_INTERVAL_DEFAULT_MS: u64 = 2_000;
pub const POLL_INTERVAL_MIN_MS: u64 = 1_000;
pub const POLL_INTERVAL_MAX_MS: u64 = 10_000;

/// 事件流心跳间隔默认值与边界（毫秒）
pub const STREAM_HEARTBEAT_DEFAULT_MS: u64 = 30_000;
pub const STREAM_HEARTBEAT_MIN_MS: u64 = 15_000;
pub const STREAM_HEARTBEAT_MAX_MS: u64 = 60_000;

/// 用户结果流最长持续时间默认值与边界（毫秒）
pub const USER_STREAM_MAX_DEFAULT_MS: u64 = 300_000;
pub const USER_STREAM_MAX_MIN_MS: u64 = 60_000;
pub const USER_STREAM_MAX_MAX_MS: u64 = 600_000;

/// 处理器任务流最长持续时间默认值与边界（毫秒）
pub const PROCESSOR_STREAM_MAX_DEFAULT_MS: u64 = 3_600_000;
pub const PROCESSOR_STREAM_MAX_MIN_MS: u64 = 60_000;
pub const PROCESSOR_STREAM_MAX_MAX_MS: u64 = 7_200_000;

/// SSE协议层keepalive注释间隔（秒）
pub const KEEPALIVE_INTERVAL_SECS: u64 = 25;

/// 终态事件发出后到关闭连接的宽限时间（毫秒）
pub const STREAM_CLOSE_GRACE_MS: u64 = 100;

/// 处理器订阅时同步推送的待处理任务数上限
pub const INITIAL_PENDING_SCAN_LIMIT: i64 = 10;

/// 数据库繁忙重试默认次数
pub const DB_BUSY_RETRIES: u32 = 3;

/// 数据库单次操作截止时间（秒）
pub const DB_OPERATION_DEADLINE_SECS: u64 = 30;

/// 数据库并发操作上限
pub const DB_MAX_INFLIGHT_OPS: usize = 3;

/// 令牌默认有效期（秒）
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;
