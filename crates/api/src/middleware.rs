//! HTTP中间件

use axum::extract::{Query, Request, State};
use axum::http::{header::AUTHORIZATION, Method};
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;
use crate::routes::AppState;

pub const API_KEY_HEADER: &str = "X-API-Key";

pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
}

pub fn trace_layer(
) -> TraceLayer<tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>>
{
    TraceLayer::new_for_http()
}

pub async fn request_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    info!(
        "[REQ] {} {} - 状态: {} - 耗时: {:?}",
        method,
        uri,
        response.status(),
        start.elapsed()
    );

    response
}

#[derive(Debug, Deserialize)]
struct ApiKeyQuery {
    api_key: Option<String>,
}

/// 处理器内部接口的共享密钥校验。
/// 接受`Authorization: Bearer`、`X-API-Key`头或`api_key`查询参数
/// （最后一种是给无法自定义请求头的EventSource客户端用的）。
pub async fn api_key_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = request.headers();

    let mut candidate = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(crate::auth::BEARER_PREFIX))
        .map(str::to_string);

    if candidate.is_none() {
        candidate = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
    }

    if candidate.is_none() {
        if let Ok(Query(query)) = Query::<ApiKeyQuery>::try_from_uri(request.uri()) {
            candidate = query.api_key;
        }
    }

    match candidate {
        Some(key) if state.api_keys.validate(&key) => Ok(next.run(request).await),
        Some(_) => Err(ApiError::Unauthorized("invalid API key".to_string())),
        None => Err(ApiError::Unauthorized("missing API key".to_string())),
    }
}
