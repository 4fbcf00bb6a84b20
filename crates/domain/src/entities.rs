//! Domain Entities
//!
//! 核心领域实体定义，包含任务、限流计数器、处理器指标快照等业务核心概念。
//! 所有时间字段统一为epoch毫秒。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use broker_common::constants::DEFAULT_MAX_RETRIES;
use broker_errors::BrokerResult;

// ============================================================================
// 任务相关实体
// ============================================================================

/// 任务状态
///
/// 任务生命周期：pending经claim进入processing，processing经complete/fail
/// 进入终态，租约过期时回到pending（还有重试额度）或进入failed。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// 任务是否仍在流转中（pending或processing）
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Processing)
    }

    /// 任务是否已到达终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// 状态机合法转换判定
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Processing) => true,
            (TaskStatus::Processing, TaskStatus::Completed) => true,
            (TaskStatus::Processing, TaskStatus::Failed) => true,
            (TaskStatus::Processing, TaskStatus::Pending) => true,
            _ => false,
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = broker_errors::BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(broker_errors::BrokerError::validation_error(format!(
                "invalid task status: {s}"
            ))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 用户评价
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskRating {
    #[serde(rename = "upvote")]
    Upvote,
    #[serde(rename = "downvote")]
    Downvote,
}

impl TaskRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRating::Upvote => "upvote",
            TaskRating::Downvote => "downvote",
        }
    }

    /// 解析投票请求：空字符串表示撤销当前评价
    pub fn parse_vote(value: &str) -> BrokerResult<Option<TaskRating>> {
        match value {
            "upvote" => Ok(Some(TaskRating::Upvote)),
            "downvote" => Ok(Some(TaskRating::Downvote)),
            "" => Ok(None),
            _ => Err(broker_errors::BrokerError::validation_error(
                "Invalid vote value. Must be 'upvote', 'downvote', or empty string",
            )),
        }
    }
}

/// 任务
///
/// 用户提交的一个LLM推理工作单元。`product_data`与`ollama_params`对
/// 分发核心不透明，后者以JSON文本持久化、仅在需要语义的边界解析。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub product_data: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    pub priority: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ollama_params: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_duration: Option<i64>,
    #[serde(rename = "rating", skip_serializing_if = "Option::is_none")]
    pub rating: Option<TaskRating>,
}

impl Task {
    /// 构造一个新的待处理任务，ID为随机UUID文本
    pub fn new_pending(user_id: &str, product_data: &str, priority: i64, now: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            product_data: product_data.to_string(),
            status: TaskStatus::Pending,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            priority,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            processor_id: None,
            processing_started_at: None,
            heartbeat_at: None,
            timeout_at: None,
            ollama_params: None,
            estimated_duration: None,
            actual_duration: None,
            rating: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn set_ollama_params(&mut self, params: Option<&OllamaParams>) -> BrokerResult<()> {
        self.ollama_params = match params {
            Some(p) => Some(serde_json::to_string(p)?),
            None => None,
        };
        Ok(())
    }

    pub fn get_ollama_params(&self) -> BrokerResult<Option<OllamaParams>> {
        match &self.ollama_params {
            Some(raw) if !raw.is_empty() => Ok(Some(serde_json::from_str(raw)?)),
            _ => Ok(None),
        }
    }
}

/// Ollama推理参数
///
/// 分发核心不读取其内容，仅在创建与展示边界做结构化转换。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OllamaParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

// ============================================================================
// 限流与指标实体
// ============================================================================

/// 滑动窗口限流计数器
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    pub user_id: String,
    pub request_count: i64,
    pub window_start: i64,
    pub last_request: i64,
}

impl RateLimit {
    /// 用户尚无记录时的零值快照
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            request_count: 0,
            window_start: 0,
            last_request: 0,
        }
    }
}

/// 处理器指标快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorMetrics {
    pub processor_id: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub queue_size: i64,
    pub active_tasks: i64,
    pub last_updated: i64,
    pub created_at: i64,
}

impl ProcessorMetrics {
    /// 综合负载因子，用于估算与指标排序
    pub fn load_factor(&self) -> f64 {
        (self.cpu_usage * 0.3 + self.memory_usage * 0.3 + self.active_tasks as f64 * 0.4) / 100.0
    }

    /// 可用容量，下限10%
    pub fn capacity_factor(&self) -> f64 {
        (1.0 - self.load_factor()).max(0.1)
    }
}

// ============================================================================
// 查询与报表辅助类型
// ============================================================================

/// 任务列表过滤条件
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub user_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

/// 心跳失联的进行中任务（清理专用投影）
#[derive(Debug, Clone)]
pub struct StaleTask {
    pub id: String,
    pub processor_id: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
}

/// 任务存量统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskBreakdown {
    pub total_tasks: i64,
    pub pending_tasks: i64,
    pub processing_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub tasks_older_than_retention: i64,
    pub timed_out_tasks: i64,
}

/// 评价汇总
#[derive(Debug, Clone, Default, Serialize)]
pub struct RatingTotals {
    pub upvotes: i64,
    pub downvotes: i64,
    pub total_rated: i64,
}

/// 评价统计分组粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatingPeriod {
    Hour,
    Day,
}

impl std::str::FromStr for RatingPeriod {
    type Err = broker_errors::BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(RatingPeriod::Hour),
            "day" => Ok(RatingPeriod::Day),
            _ => Err(broker_errors::BrokerError::validation_error(format!(
                "unsupported period: {s}"
            ))),
        }
    }
}

/// 按时间段聚合的评价统计
#[derive(Debug, Clone, Serialize)]
pub struct PeriodRatingRow {
    pub period: String,
    pub upvotes: i64,
    pub downvotes: i64,
    pub total_rated: i64,
    pub quality_score: f64,
}

/// 处理器负载行（指标接口投影，含活跃任务联查）
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorLoadRow {
    pub processor_id: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub queue_size: i64,
    pub last_updated: i64,
    pub active_tasks: i64,
    pub avg_processing_time: f64,
}
