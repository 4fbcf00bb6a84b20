use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("用户已有进行中的任务: {user_id}")]
    ActiveTaskExists { user_id: String },
    #[error("请求频率超限: {user_id}")]
    RateLimited { user_id: String },
    #[error("认证失败: {0}")]
    Authentication(String),
    #[error("没有访问权限")]
    Forbidden,
    #[error("无效的任务状态转换: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("数据验证失败: {0}")]
    Validation(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("存储繁忙: {0}")]
    StoreBusy(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn active_task_exists<S: Into<String>>(user_id: S) -> Self {
        Self::ActiveTaskExists {
            user_id: user_id.into(),
        }
    }
    pub fn rate_limited<S: Into<String>>(user_id: S) -> Self {
        Self::RateLimited {
            user_id: user_id.into(),
        }
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn auth_error<S: Into<String>>(msg: S) -> Self {
        Self::Authentication(msg.into())
    }

    /// 判断错误是否可以通过重试恢复
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::StoreBusy(_) | BrokerError::Timeout(_) => true,
            BrokerError::Database(sqlx::Error::Database(db_err)) => {
                let msg = db_err.message().to_lowercase();
                msg.contains("locked") || msg.contains("busy")
            }
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::Internal(_) | BrokerError::Configuration(_)
        )
    }

    /// 面向调用方的简短描述，内部细节只进日志
    pub fn public_message(&self) -> &str {
        match self {
            BrokerError::TaskNotFound { .. } => "Task not found",
            BrokerError::ActiveTaskExists { .. } => {
                "User already has an active task. Please wait for the current task to complete."
            }
            BrokerError::RateLimited { .. } => "Rate limit exceeded",
            BrokerError::Authentication(_) => "Invalid token",
            BrokerError::Forbidden => "Access denied",
            BrokerError::Validation(_) => "Invalid request",
            BrokerError::InvalidTransition { .. } => "Invalid task state transition",
            BrokerError::Timeout(_) | BrokerError::StoreBusy(_) => {
                "Service busy, please retry later"
            }
            _ => "Internal server error",
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for BrokerError {
    fn from(err: anyhow::Error) -> Self {
        BrokerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BrokerError::StoreBusy("database is locked".to_string()).is_retryable());
        assert!(BrokerError::Timeout("db deadline".to_string()).is_retryable());
        assert!(!BrokerError::Forbidden.is_retryable());
        assert!(!BrokerError::task_not_found("t-1").is_retryable());
    }

    #[test]
    fn test_public_message_hides_details() {
        let err = BrokerError::DatabaseOperation("UNIQUE constraint failed: tasks.id".to_string());
        assert_eq!(err.public_message(), "Internal server error");

        let err = BrokerError::active_task_exists("u-1");
        assert!(err.public_message().contains("active task"));
    }

    #[test]
    fn test_helper_constructors() {
        match BrokerError::task_not_found("abc") {
            BrokerError::TaskNotFound { id } => assert_eq!(id, "abc"),
            other => panic!("unexpected variant: {other:?}"),
        }
        match BrokerError::rate_limited("u-9") {
            BrokerError::RateLimited { user_id } => assert_eq!(user_id, "u-9"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
