pub mod metrics_repository;
pub mod rate_limit_repository;
pub mod rating_repository;
pub mod task_repository;

pub use metrics_repository::SqliteMetricsRepository;
pub use rate_limit_repository::SqliteRateLimitRepository;
pub use rating_repository::SqliteRatingRepository;
pub use task_repository::SqliteTaskRepository;

use broker_domain::entities::Task;
use broker_errors::BrokerResult;
use sqlx::Row;

/// tasks表全列清单，SELECT语句共用
pub(crate) const TASK_COLUMNS: &str = "id, user_id, product_data, status, result, error_message, \
     created_at, updated_at, completed_at, priority, retry_count, max_retries, \
     processor_id, processing_started_at, heartbeat_at, timeout_at, \
     ollama_params, estimated_duration, actual_duration, user_rating";

pub(crate) fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> BrokerResult<Task> {
    Ok(Task {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        product_data: row.try_get("product_data")?,
        status: row.try_get("status")?,
        result: row.try_get("result")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        priority: row.try_get("priority")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        processor_id: row.try_get("processor_id")?,
        processing_started_at: row.try_get("processing_started_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        timeout_at: row.try_get("timeout_at")?,
        ollama_params: row.try_get("ollama_params")?,
        estimated_duration: row.try_get("estimated_duration")?,
        actual_duration: row.try_get("actual_duration")?,
        rating: row.try_get("user_rating")?,
    })
}

/// 为IN子句生成 `?, ?, ?` 形式的占位符
pub(crate) fn in_placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
