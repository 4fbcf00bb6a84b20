//! 处理器内部接口
//!
//! 整组路由由共享API密钥中间件保护。

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use broker_common::constants::METRICS_FRESHNESS_MS;
use broker_common::time::now_ms;
use broker_common::types::RateLimitSettings;
use broker_domain::entities::{RatingPeriod, TaskFilter, TaskStatus};

use crate::auth::UserTokenSpec;
use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

fn clamp_limit(value: Option<i64>, default: i64, max: i64) -> i64 {
    match value {
        Some(v) if v > 0 && v <= max => v,
        _ => default,
    }
}

#[derive(Debug, Deserialize)]
pub struct PendingTasksQuery {
    pub limit: Option<i64>,
}

/// GET /api/internal/tasks
pub async fn get_pending_tasks(
    State(state): State<AppState>,
    Query(query): Query<PendingTasksQuery>,
) -> ApiResult<Json<Value>> {
    let limit = clamp_limit(query.limit, 20, 100);
    let tasks = state.tasks.pending_page(limit).await?;
    Ok(Json(json!({ "tasks": tasks })))
}

#[derive(Debug, Deserialize)]
pub struct AllTasksQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub user_id: Option<String>,
}

/// GET /api/internal/all-tasks
pub async fn get_all_tasks(
    State(state): State<AppState>,
    Query(query): Query<AllTasksQuery>,
) -> ApiResult<Json<Value>> {
    let filter = TaskFilter {
        user_id: query.user_id.filter(|u| !u.is_empty()),
        limit: clamp_limit(query.limit, 50, 1000),
        offset: query.offset.filter(|o| *o >= 0).unwrap_or(0),
    };
    let tasks = state.tasks.list(&filter).await?;
    Ok(Json(json!({ "tasks": tasks })))
}

#[derive(Debug, Deserialize)]
pub struct ClaimTasksRequest {
    pub processor_id: String,
    pub batch_size: Option<i64>,
    pub processor_load: Option<f64>,
    pub timeout_ms: Option<i64>,
    pub use_fair_distribution: Option<bool>,
}

/// POST /api/internal/claim - 批量或公平认领
pub async fn claim_tasks(
    State(state): State<AppState>,
    Json(request): Json<ClaimTasksRequest>,
) -> ApiResult<Json<Value>> {
    if request.processor_id.is_empty() {
        return Err(ApiError::BadRequest("processor_id is required".to_string()));
    }

    let use_fair = request.use_fair_distribution.unwrap_or(false);

    if use_fair {
        let outcome = state
            .dispatch
            .claim_fair(
                &request.processor_id,
                request.batch_size,
                request.processor_load.unwrap_or(0.0),
                request.timeout_ms,
            )
            .await?;
        Ok(Json(json!({
            "success": true,
            "tasks": outcome.tasks,
            "claimed_count": outcome.tasks.len(),
            "fair_distribution_info": outcome.fair_info,
        })))
    } else {
        let tasks = state
            .dispatch
            .claim_batch(&request.processor_id, request.batch_size, request.timeout_ms)
            .await?;
        Ok(Json(json!({
            "success": true,
            "tasks": tasks,
            "claimed_count": tasks.len(),
        })))
    }
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub processor_id: String,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub queue_size: Option<i64>,
}

/// POST /api/internal/heartbeat - 任务心跳，附带指标快照
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<Json<Value>> {
    if request.task_id.is_empty() || request.processor_id.is_empty() {
        return Err(ApiError::BadRequest(
            "taskId and processor_id are required".to_string(),
        ));
    }

    if request.cpu_usage.is_some() || request.memory_usage.is_some() || request.queue_size.is_some()
    {
        let active = state
            .tasks
            .count_processing_for(&request.processor_id)
            .await?;
        state
            .metrics
            .upsert(
                &request.processor_id,
                request.cpu_usage,
                request.memory_usage,
                request.queue_size,
                active,
                now_ms(),
            )
            .await?;
    }

    state
        .lifecycle
        .heartbeat(&request.task_id, &request.processor_id)
        .await?;

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct ProcessorHeartbeatRequest {
    pub processor_id: String,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub queue_size: Option<i64>,
}

/// POST /api/internal/processor-heartbeat - 处理器存活与指标上报
pub async fn processor_heartbeat(
    State(state): State<AppState>,
    Json(request): Json<ProcessorHeartbeatRequest>,
) -> ApiResult<Json<Value>> {
    if request.processor_id.is_empty() {
        return Err(ApiError::BadRequest("processor_id is required".to_string()));
    }

    let active = state
        .tasks
        .count_processing_for(&request.processor_id)
        .await?;
    state
        .metrics
        .upsert(
            &request.processor_id,
            request.cpu_usage,
            request.memory_usage,
            request.queue_size,
            active,
            now_ms(),
        )
        .await?;

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct CompleteTaskRequest {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub processor_id: Option<String>,
    pub status: String,
    pub result: Option<String>,
    pub error_message: Option<String>,
}

/// POST /api/internal/complete
///
/// `processor_id`可省略：带上时强制所有者匹配，省略时任何处理器
/// （或代为收尾的清理器）都可以终结任务。
pub async fn complete_task(
    State(state): State<AppState>,
    Json(request): Json<CompleteTaskRequest>,
) -> ApiResult<Json<Value>> {
    if request.task_id.is_empty() {
        return Err(ApiError::BadRequest("taskId is required".to_string()));
    }

    let status: TaskStatus = request
        .status
        .parse()
        .map_err(|_| ApiError::BadRequest("status must be 'completed' or 'failed'".to_string()))?;
    if !status.is_terminal() {
        return Err(ApiError::BadRequest(
            "status must be 'completed' or 'failed'".to_string(),
        ));
    }

    state
        .lifecycle
        .complete(
            &request.task_id,
            status,
            request.result.as_deref(),
            request.error_message.as_deref(),
            request.processor_id.as_deref(),
        )
        .await?;

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct RequeueRequest {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub processor_id: String,
    pub reason: Option<String>,
}

/// POST /api/internal/requeue - 处理器主动归还任务
pub async fn requeue_task(
    State(state): State<AppState>,
    Json(request): Json<RequeueRequest>,
) -> ApiResult<Json<Value>> {
    if request.task_id.is_empty() || request.processor_id.is_empty() {
        return Err(ApiError::BadRequest(
            "taskId and processor_id are required".to_string(),
        ));
    }

    state
        .lifecycle
        .requeue(
            &request.task_id,
            &request.processor_id,
            request.reason.as_deref(),
        )
        .await?;

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct WorkStealRequest {
    pub processor_id: String,
    pub max_steal_count: Option<i64>,
    pub timeout_ms: Option<i64>,
}

/// POST /api/internal/work-steal
pub async fn work_steal(
    State(state): State<AppState>,
    Json(request): Json<WorkStealRequest>,
) -> ApiResult<Json<Value>> {
    if request.processor_id.is_empty() {
        return Err(ApiError::BadRequest("processor_id is required".to_string()));
    }

    let stolen = state
        .dispatch
        .steal_work(
            &request.processor_id,
            request.max_steal_count,
            request.timeout_ms,
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "stolen_tasks": stolen,
        "stolen_count": stolen.len(),
    })))
}

/// POST /api/internal/cleanup - 手动触发一轮清理
pub async fn cleanup(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let outcome = state.cleanup.sweep().await?;
    Ok(Json(json!({
        "message": "Cleanup completed",
        "stats": outcome.stats,
        "cleaned": outcome.cleaned,
    })))
}

/// GET /api/internal/cleanup/stats
pub async fn cleanup_stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let stats = state.cleanup.stats().await?;
    Ok(Json(json!({
        "success": true,
        "stats": stats,
    })))
}

/// GET /api/internal/metrics - 处理器负载，综合负载升序
pub async fn processor_metrics(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let processors = state
        .metrics
        .load_ordered(now_ms() - METRICS_FRESHNESS_MS)
        .await?;
    Ok(Json(json!({
        "success": true,
        "processors": processors,
    })))
}

/// GET /api/internal/estimated-time
pub async fn estimated_time(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let estimated = state.estimator.estimate().await?;
    Ok(Json(json!({
        "success": true,
        "estimated_time": estimated,
    })))
}

#[derive(Debug, Deserialize)]
pub struct GenerateTokenRequest {
    pub user_id: Option<String>,
    pub processor_id: Option<String>,
    pub duration_hours: Option<i64>,
    #[serde(rename = "taskId")]
    pub task_id: Option<String>,
    pub expires_in: Option<i64>,
    pub product_data: Option<String>,
    pub priority: Option<i64>,
    pub ollama_params: Option<broker_domain::entities::OllamaParams>,
    pub rate_limit: Option<RateLimitSettings>,
}

/// POST /api/internal/generate-token - 签发用户或处理器令牌
pub async fn generate_token(
    State(state): State<AppState>,
    Json(request): Json<GenerateTokenRequest>,
) -> ApiResult<Json<Value>> {
    // 处理器令牌分支优先
    if let Some(processor_id) = request.processor_id.filter(|p| !p.is_empty()) {
        let expires_in = request
            .duration_hours
            .map(|hours| hours * 3600)
            .unwrap_or(3600);
        let token = state
            .tokens
            .issue_processor_token(&processor_id, Some(expires_in))?;
        info!("已签发处理器令牌: {}", processor_id);
        return Ok(Json(json!({
            "success": true,
            "token": token,
            "expires_in": expires_in,
        })));
    }

    let user_id = request
        .user_id
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::BadRequest("user_id or processor_id is required".to_string()))?;

    let expires_in = request.expires_in.unwrap_or(3600);
    let token = state.tokens.issue_user_token(
        &user_id,
        UserTokenSpec {
            task_id: request.task_id.filter(|t| !t.is_empty()),
            product_data: request.product_data.filter(|d| !d.is_empty()),
            priority: Some(request.priority.unwrap_or(0)),
            ollama_params: request.ollama_params,
            rate_limit: request.rate_limit,
        },
        Some(expires_in),
    )?;

    info!("已签发用户令牌: {}", user_id);
    Ok(Json(json!({
        "success": true,
        "token": token,
        "expires_in": expires_in,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RatingStatsQuery {
    pub user_id: Option<String>,
}

/// GET /api/internal/rating-stats - 评价汇总
pub async fn rating_stats(
    State(state): State<AppState>,
    Query(query): Query<RatingStatsQuery>,
) -> ApiResult<Json<Value>> {
    let totals = state
        .ratings
        .totals(query.user_id.as_deref().filter(|u| !u.is_empty()))
        .await?;
    Ok(Json(json!({
        "success": true,
        "stats": totals,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RatingAnalyticsQuery {
    pub period: Option<String>,
    pub count: Option<i64>,
}

/// GET /api/internal/rating-analytics - 按时段的评价统计与最近评价
pub async fn rating_analytics(
    State(state): State<AppState>,
    Query(query): Query<RatingAnalyticsQuery>,
) -> ApiResult<Json<Value>> {
    let period: RatingPeriod = query.period.as_deref().unwrap_or("day").parse()?;
    let count = clamp_limit(query.count, 7, 100);

    let periods = state.ratings.by_period(period, count).await?;
    let recent = state.ratings.recent_rated(10).await?;

    Ok(Json(json!({
        "success": true,
        "periods": periods,
        "recent_rated": recent,
    })))
}
