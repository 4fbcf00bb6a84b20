//! 测试数据构造器

use broker_common::time::now_ms;
use broker_domain::entities::{Task, TaskRating, TaskStatus};
use uuid::Uuid;

/// Task构造器，默认是一个刚创建的待处理任务
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        let now = now_ms();
        Self {
            task: Task {
                id: Uuid::new_v4().to_string(),
                user_id: "test-user".to_string(),
                product_data: "test product data".to_string(),
                status: TaskStatus::Pending,
                result: None,
                error_message: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
                priority: 0,
                retry_count: 0,
                max_retries: 3,
                processor_id: None,
                processing_started_at: None,
                heartbeat_at: None,
                timeout_at: None,
                ollama_params: None,
                estimated_duration: None,
                actual_duration: None,
                rating: None,
            },
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.task.id = id.to_string();
        self
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.task.user_id = user_id.to_string();
        self
    }

    pub fn with_product_data(mut self, product_data: &str) -> Self {
        self.task.product_data = product_data.to_string();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn with_retry_count(mut self, retry_count: i64) -> Self {
        self.task.retry_count = retry_count;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.task.max_retries = max_retries;
        self
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.task.created_at = created_at;
        self.task.updated_at = created_at;
        self
    }

    pub fn with_rating(mut self, rating: TaskRating) -> Self {
        self.task.rating = Some(rating);
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}
