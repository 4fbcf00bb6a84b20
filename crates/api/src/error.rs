//! API错误映射
//!
//! 统一把核心错误翻译成HTTP状态码与对外的错误码。内部细节只进
//! 日志，永远不出现在响应体里。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use broker_errors::BrokerError;

use crate::response::ErrorBody;

/// API错误类型
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("认证失败: {0}")]
    Unauthorized(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            ApiError::Unauthorized(_) => (
                StatusCode::UNAUTHORIZED,
                "AUTH_ERROR",
                "Invalid token".to_string(),
            ),
            ApiError::Broker(err) => match err {
                BrokerError::TaskNotFound { .. } => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    err.public_message().to_string(),
                ),
                BrokerError::ActiveTaskExists { .. } => (
                    StatusCode::CONFLICT,
                    "CONFLICT",
                    err.public_message().to_string(),
                ),
                BrokerError::RateLimited { .. } => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMIT_ERROR",
                    err.public_message().to_string(),
                ),
                BrokerError::Authentication(_) => (
                    StatusCode::UNAUTHORIZED,
                    "AUTH_ERROR",
                    err.public_message().to_string(),
                ),
                BrokerError::Forbidden => (
                    StatusCode::FORBIDDEN,
                    "AUTHZ_ERROR",
                    err.public_message().to_string(),
                ),
                // 校验类消息是面向调用方措辞的，原样返回
                BrokerError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                BrokerError::InvalidTransition { .. } => (
                    StatusCode::BAD_REQUEST,
                    "VALIDATION_ERROR",
                    err.public_message().to_string(),
                ),
                BrokerError::Timeout(_) | BrokerError::StoreBusy(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_BUSY",
                    err.public_message().to_string(),
                ),
                _ => {
                    error!("内部错误: {}", err);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "Internal server error".to_string(),
                    )
                }
            },
        };

        (status, Json(ErrorBody::new(message, code))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(ApiError::Broker(BrokerError::task_not_found("t"))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(ApiError::Broker(BrokerError::active_task_exists("u"))),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ApiError::Broker(BrokerError::rate_limited("u"))),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(ApiError::Broker(BrokerError::Forbidden)),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(ApiError::Broker(BrokerError::validation_error("bad"))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(ApiError::Unauthorized("missing".to_string())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(ApiError::Broker(BrokerError::Internal("boom".to_string()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(ApiError::Broker(BrokerError::StoreBusy("locked".to_string()))),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
