//! 用户侧接口
//!
//! 所有操作凭短期令牌授权；流式接口在`stream`模块。

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use broker_common::time::{format_ms, format_ms_opt};
use broker_dispatcher::CreateTaskInput;
use broker_domain::entities::{Task, TaskRating};
use broker_errors::BrokerError;

use crate::auth::{bearer_token, TokenClaims};
use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

/// GET / 与 /health
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "message": "LLM Broker API v1.0",
        "status": "ok",
        "endpoints": {
            "api": {
                "create": "/api/create - Create task (JWT)",
                "result": "/api/result - Get result (JWT)",
                "internal": "/api/internal/* - Processor endpoints (API key)",
            },
        },
    }))
}

fn verify_bearer(state: &AppState, headers: &HeaderMap) -> ApiResult<TokenClaims> {
    let token =
        bearer_token(headers).ok_or_else(|| ApiError::Unauthorized("missing token".to_string()))?;
    Ok(state.tokens.verify(token)?)
}

fn require_user_id(claims: &TokenClaims) -> ApiResult<String> {
    claims
        .resolved_user_id()
        .map(str::to_string)
        .ok_or_else(|| ApiError::BadRequest("Invalid token: missing user_id".to_string()))
}

/// POST /api/create
pub async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let claims = verify_bearer(&state, &headers)?;
    let user_id = require_user_id(&claims)?;

    let product_data = match claims.product_data {
        Some(data) if !data.is_empty() => data,
        _ => {
            return Err(ApiError::BadRequest(
                "Missing product_data in request body or JWT token".to_string(),
            ))
        }
    };

    let task = state
        .lifecycle
        .create_task(CreateTaskInput {
            user_id: user_id.clone(),
            product_data,
            priority: claims.priority.unwrap_or(0),
            ollama_params: claims.ollama_params,
            rate_limit: claims.rate_limit,
        })
        .await?;

    let estimated_time = state.estimator.estimate().await?;
    let result_token = state.tokens.issue_result_token(&user_id, &task.id)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "taskId": task.id,
            "estimatedTime": estimated_time,
            "token": result_token,
        })),
    ))
}

/// POST /api/result
pub async fn get_result(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let claims = verify_bearer(&state, &headers)?;
    let user_id = require_user_id(&claims)?;
    let task_id = claims
        .task_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Invalid token: missing taskId".to_string()))?;

    let task = state
        .tasks
        .get_by_id(&task_id)
        .await?
        .ok_or_else(|| BrokerError::task_not_found(&task_id))?;

    if task.user_id != user_id {
        return Err(BrokerError::Forbidden.into());
    }

    let mut data = json!({
        "success": true,
        "status": task.status,
        "result": task.result,
        "createdAt": format_ms(task.created_at),
        "rating": task.rating,
    });
    if let Some(completed_at) = task.completed_at {
        data["processedAt"] = json!(format_ms(completed_at));
    }

    Ok(Json(data))
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// GET /api/get - 用户最近一个任务与限流快照
pub async fn get_user_data(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Json<Value>> {
    let token = query
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing token parameter".to_string()))?;
    let claims = state.tokens.verify(&token)?;
    let user_id = require_user_id(&claims)?;

    let latest = state.tasks.get_latest_by_user(&user_id).await?;
    let rate_limit = state.rate_limits.get(&user_id).await?;

    let window_ms = state.config.rate_limit.window_ms;
    let mut data = json!({
        "success": true,
        "user_id": user_id,
        "rate_limit": {
            "request_count": rate_limit.request_count,
            "request_limit": state.config.rate_limit.max_requests,
            "window_start": rate_limit.window_start,
            "last_request": rate_limit.last_request,
            "period_start": format_ms(rate_limit.window_start),
            "period_end": format_ms(rate_limit.window_start + window_ms),
        },
    });

    data["last_task"] = match latest {
        Some(task) => user_task_view(&state, &user_id, task)?,
        None => Value::Null,
    };

    Ok(Json(data))
}

fn user_task_view(state: &AppState, user_id: &str, task: Task) -> ApiResult<Value> {
    let mut view = json!({
        "id": task.id,
        "status": task.status,
        "product_data": task.product_data,
        "priority": task.priority,
        "created_at": format_ms(task.created_at),
        "updated_at": format_ms(task.updated_at),
        "rating": task.rating,
    });

    if let Some(result) = &task.result {
        view["result"] = json!(result);
    }
    if let Some(error_message) = &task.error_message {
        view["error_message"] = json!(error_message);
    }
    if let Some(completed_at) = format_ms_opt(task.completed_at) {
        view["completed_at"] = json!(completed_at);
    }
    if let Some(started_at) = format_ms_opt(task.processing_started_at) {
        view["processing_started_at"] = json!(started_at);
    }
    match task.get_ollama_params() {
        Ok(Some(params)) => view["ollama_params"] = json!(params),
        Ok(None) => {}
        // 历史数据可能存有非法JSON，退回原始文本
        Err(_) => view["ollama_params"] = json!(task.ollama_params),
    }

    // 活跃或已完成的任务附带结果令牌，便于前端续接查询
    if !matches!(task.status, broker_domain::entities::TaskStatus::Failed) {
        match state.tokens.issue_result_token(user_id, &task.id) {
            Ok(token) => view["token"] = json!(token),
            Err(e) => warn!("为任务 {} 签发结果令牌失败: {}", task.id, e),
        }
    }

    Ok(view)
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub vote_type: String,
}

/// POST /api/tasks/vote - 切换语义的任务评价
pub async fn vote_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<VoteRequest>,
) -> ApiResult<Json<Value>> {
    let claims = verify_bearer(&state, &headers)?;
    let user_id = require_user_id(&claims)?;
    let task_id = claims
        .task_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Invalid token: missing taskId".to_string()))?;

    let vote = TaskRating::parse_vote(&request.vote_type)?;

    let task = state
        .tasks
        .get_by_id(&task_id)
        .await?
        .ok_or_else(|| BrokerError::task_not_found(&task_id))?;
    if task.user_id != user_id {
        return Err(BrokerError::Forbidden.into());
    }

    // 同值投票等于撤销，异值替换，空值撤销
    let new_rating = match vote {
        Some(vote) if task.rating == Some(vote) => None,
        Some(vote) => Some(vote),
        None => None,
    };

    state
        .ratings
        .set_rating(&task_id, &user_id, new_rating, broker_common::time::now_ms())
        .await?;

    Ok(Json(json!({
        "success": true,
        "rating": new_rating,
    })))
}
