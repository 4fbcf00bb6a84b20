//! 数据库访问层
//!
//! 嵌入式SQLite是唯一事实来源。所有写操作经过`StoreGate`串行化，
//! 瞬时繁忙通过`retry_on_busy`指数退避重试，条件更新未命中不重试。

pub mod sqlite;

use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

use broker_common::constants::{DB_MAX_INFLIGHT_OPS, DB_OPERATION_DEADLINE_SECS};
use broker_config::DatabaseConfig;
use broker_errors::{BrokerError, BrokerResult};

/// 建表语句，幂等，启动时执行一次
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    product_data TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    result TEXT,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER,
    priority INTEGER DEFAULT 0,
    retry_count INTEGER DEFAULT 0,
    max_retries INTEGER DEFAULT 3,
    processor_id TEXT,
    processing_started_at INTEGER,
    heartbeat_at INTEGER,
    timeout_at INTEGER,
    ollama_params TEXT,
    estimated_duration INTEGER DEFAULT 300000,
    actual_duration INTEGER,
    user_rating TEXT CHECK (user_rating IN ('upvote', 'downvote') OR user_rating IS NULL)
);

CREATE TABLE IF NOT EXISTS rate_limits (
    user_id TEXT PRIMARY KEY,
    request_count INTEGER NOT NULL DEFAULT 0,
    window_start INTEGER NOT NULL,
    last_request INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS processor_metrics (
    processor_id TEXT PRIMARY KEY,
    cpu_usage REAL NOT NULL DEFAULT 0.0,
    memory_usage REAL NOT NULL DEFAULT 0.0,
    queue_size INTEGER NOT NULL DEFAULT 0,
    active_tasks INTEGER NOT NULL DEFAULT 0,
    last_updated INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_user_id ON tasks(user_id);
CREATE INDEX IF NOT EXISTS idx_tasks_processor_id ON tasks(processor_id);
CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_timeout_at ON tasks(timeout_at);
CREATE INDEX IF NOT EXISTS idx_rate_limits_window_start ON rate_limits(window_start);
CREATE INDEX IF NOT EXISTS idx_processor_metrics_last_updated ON processor_metrics(last_updated);
"#;

/// 存储访问闸门
///
/// 并发数据库操作不超过`DB_MAX_INFLIGHT_OPS`个；写操作额外持有
/// 互斥锁，保证"仍为pending才转processing"之类的条件更新不会交错。
/// 每次操作带30秒截止时间。
pub struct StoreGate {
    write_lock: Mutex<()>,
    inflight: Semaphore,
    deadline: Duration,
}

impl StoreGate {
    pub fn new() -> Self {
        Self {
            write_lock: Mutex::new(()),
            inflight: Semaphore::new(DB_MAX_INFLIGHT_OPS),
            deadline: Duration::from_secs(DB_OPERATION_DEADLINE_SECS),
        }
    }

    /// 读操作：受并发上限与截止时间约束
    pub async fn read<T, Fut>(&self, op: Fut) -> BrokerResult<T>
    where
        Fut: Future<Output = BrokerResult<T>>,
    {
        tokio::time::timeout(self.deadline, async {
            let _permit = self
                .inflight
                .acquire()
                .await
                .map_err(|_| BrokerError::Internal("store gate closed".to_string()))?;
            op.await
        })
        .await
        .map_err(|_| BrokerError::Timeout("database operation deadline exceeded".to_string()))?
    }

    /// 写操作：独占写锁，串行执行
    pub async fn write<T, Fut>(&self, op: Fut) -> BrokerResult<T>
    where
        Fut: Future<Output = BrokerResult<T>>,
    {
        tokio::time::timeout(self.deadline, async {
            let _guard = self.write_lock.lock().await;
            let _permit = self
                .inflight
                .acquire()
                .await
                .map_err(|_| BrokerError::Internal("store gate closed".to_string()))?;
            op.await
        })
        .await
        .map_err(|_| BrokerError::Timeout("database operation deadline exceeded".to_string()))?
    }
}

impl Default for StoreGate {
    fn default() -> Self {
        Self::new()
    }
}

/// 繁忙重试：基础退避100ms×尝试次数，抖动50ms×已失败次数。
/// 只有可重试错误（锁冲突、超时）才重试，其余错误立即上抛。
pub async fn retry_on_busy<T, F, Fut>(max_attempts: u32, mut op: F) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts || !err.is_retryable() {
                    return Err(err);
                }
                let base = Duration::from_millis(100 * attempt as u64);
                let jitter = Duration::from_millis(50 * (attempt as u64 - 1));
                debug!("存储繁忙，第{}次重试: {}", attempt, err);
                tokio::time::sleep(base + jitter).await;
            }
        }
    }
}

/// 数据库连接管理
pub struct DatabaseManager {
    pool: SqlitePool,
    gate: Arc<StoreGate>,
}

impl DatabaseManager {
    /// 打开（必要时创建）文件数据库
    pub async fn new(config: &DatabaseConfig) -> BrokerResult<Self> {
        if let Some(dir) = Path::new(&config.path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    BrokerError::Configuration(format!("创建数据库目录失败: {e}"))
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.path))
            .map_err(BrokerError::Database)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(DB_OPERATION_DEADLINE_SECS))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(options)
            .await
            .map_err(BrokerError::Database)?;

        info!("数据库已打开: {}", config.path);
        Ok(Self {
            pool,
            gate: Arc::new(StoreGate::new()),
        })
    }

    /// 内存数据库，测试专用。单连接池避免`:memory:`每连接各一份。
    pub async fn new_in_memory() -> BrokerResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(BrokerError::Database)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(BrokerError::Database)?;

        Ok(Self {
            pool,
            gate: Arc::new(StoreGate::new()),
        })
    }

    /// 幂等建表
    pub async fn migrate(&self) -> BrokerResult<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(BrokerError::Database)?;
        debug!("数据库迁移完成");
        Ok(())
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub fn gate(&self) -> Arc<StoreGate> {
        Arc::clone(&self.gate)
    }

    pub async fn health_check(&self) -> BrokerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(BrokerError::Database)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_in_memory_migrate_is_idempotent() {
        let db = DatabaseManager::new_in_memory().await.expect("open");
        db.migrate().await.expect("first migrate");
        db.migrate().await.expect("second migrate");
        db.health_check().await.expect("healthy");
    }

    #[tokio::test]
    async fn test_retry_on_busy_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: BrokerResult<()> = retry_on_busy(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::StoreBusy("locked".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_on_busy_does_not_retry_predicate_misses() {
        let calls = AtomicU32::new(0);
        let result: BrokerResult<()> = retry_on_busy(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::task_not_found("t-1")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_on_busy_recovers() {
        let calls = AtomicU32::new(0);
        let result = retry_on_busy(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(BrokerError::StoreBusy("locked".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.expect("recovered"), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_gate_serialises_writes() {
        let gate = Arc::new(StoreGate::new());
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                gate.write(async {
                    let before = counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                    // 写锁独占：任何时刻最多一个写操作在途
                    assert_eq!(before, 0);
                    Ok::<_, BrokerError>(())
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.expect("join").expect("write ok");
        }
    }
}
