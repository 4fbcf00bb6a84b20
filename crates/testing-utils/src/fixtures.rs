//! 测试固件
//!
//! 内存SQLite加全部仓储，一行拉起一套可用的存储栈。

use std::sync::Arc;

use broker_common::time::now_ms;
use broker_domain::entities::{Task, TaskStatus};
use broker_domain::repositories::{
    MetricsRepository, RateLimitRepository, RatingRepository, TaskRepository,
};
use broker_infrastructure::{
    DatabaseManager, SqliteMetricsRepository, SqliteRateLimitRepository, SqliteRatingRepository,
    SqliteTaskRepository,
};

/// 一套连接到同一内存数据库的仓储
pub struct TestStore {
    pub tasks: Arc<dyn TaskRepository>,
    pub rate_limits: Arc<dyn RateLimitRepository>,
    pub metrics: Arc<dyn MetricsRepository>,
    pub ratings: Arc<dyn RatingRepository>,
}

impl TestStore {
    pub async fn new() -> Self {
        let db = DatabaseManager::new_in_memory()
            .await
            .expect("open in-memory database");
        db.migrate().await.expect("run migrations");

        Self {
            tasks: Arc::new(SqliteTaskRepository::new(db.pool(), db.gate())),
            rate_limits: Arc::new(SqliteRateLimitRepository::new(db.pool(), db.gate())),
            metrics: Arc::new(SqliteMetricsRepository::new(db.pool(), db.gate())),
            ratings: Arc::new(SqliteRatingRepository::new(db.pool(), db.gate())),
        }
    }

    /// 插入任务并认领，得到一个进行中的任务
    pub async fn seed_processing_task(&self, task: &Task, processor_id: &str, claimed_at: i64) {
        self.tasks.create(task).await.expect("create task");
        let claimed = self
            .tasks
            .try_claim(&task.id, processor_id, claimed_at, claimed_at + 300_000)
            .await
            .expect("claim task");
        assert!(claimed, "task should be claimable");
    }

    /// 插入任务并走完认领与完成，得到一个已完成任务
    pub async fn seed_completed_task(&self, task: &Task, result: &str) {
        let now = now_ms();
        self.seed_processing_task(task, "seed-processor", now).await;
        let completed = self
            .tasks
            .complete(
                &task.id,
                TaskStatus::Completed,
                Some(result),
                None,
                None,
                now,
            )
            .await
            .expect("complete task");
        assert!(completed, "task should complete");
    }
}
