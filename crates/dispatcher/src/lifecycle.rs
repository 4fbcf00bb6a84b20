//! 任务生命周期
//!
//! 状态、所有者与租约字段的唯一修改入口。所有转换经由仓储的条件
//! 更新表达，谓词未命中映射为not-found语义而不做重试。创建成功后
//! 向处理器订阅者推送`task_available`，推送失败不影响创建结果。

use std::sync::Arc;

use tracing::{debug, info};

use broker_common::time::now_ms;
use broker_common::types::RateLimitSettings;
use broker_domain::entities::{OllamaParams, Task, TaskStatus};
use broker_domain::repositories::TaskRepository;
use broker_errors::{BrokerError, BrokerResult};
use broker_events::SubscriberRegistry;

use crate::admission::AdmissionService;

/// 创建任务的输入
#[derive(Debug, Clone)]
pub struct CreateTaskInput {
    pub user_id: String,
    pub product_data: String,
    pub priority: i64,
    pub ollama_params: Option<OllamaParams>,
    pub rate_limit: Option<RateLimitSettings>,
}

pub struct TaskLifecycleService {
    tasks: Arc<dyn TaskRepository>,
    admission: Arc<AdmissionService>,
    registry: Arc<SubscriberRegistry>,
}

impl TaskLifecycleService {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        admission: Arc<AdmissionService>,
        registry: Arc<SubscriberRegistry>,
    ) -> Self {
        Self {
            tasks,
            admission,
            registry,
        }
    }

    /// 创建任务：配额检查与单活跃任务约束都先于持久化
    pub async fn create_task(&self, input: CreateTaskInput) -> BrokerResult<Task> {
        self.admission
            .check_quota(&input.user_id, input.rate_limit)
            .await?;

        let mut task = Task::new_pending(
            &input.user_id,
            &input.product_data,
            input.priority,
            now_ms(),
        );
        task.set_ollama_params(input.ollama_params.as_ref())?;

        self.tasks.create(&task).await?;
        info!("任务已创建: {} (user: {})", task.id, task.user_id);

        let delivered = self.registry.broadcast_task_available(&task).await;
        debug!("任务 {} 已推送给 {} 个处理器订阅者", task.id, delivered);

        Ok(task)
    }

    /// 心跳续租：非所有者调用不改变任何状态
    pub async fn heartbeat(&self, task_id: &str, processor_id: &str) -> BrokerResult<()> {
        if !self.tasks.heartbeat(task_id, processor_id, now_ms()).await? {
            return Err(BrokerError::task_not_found(task_id));
        }
        Ok(())
    }

    /// 终结任务。`owner`为Some时强制所有者匹配，为None时任何调用方
    /// （包括代为收尾的清理器）都可以终结。
    pub async fn complete(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&str>,
        error_message: Option<&str>,
        owner: Option<&str>,
    ) -> BrokerResult<Task> {
        if !status.is_terminal() {
            return Err(BrokerError::validation_error(
                "status must be 'completed' or 'failed'",
            ));
        }

        let hit = self
            .tasks
            .complete(task_id, status, result, error_message, owner, now_ms())
            .await?;
        if !hit {
            return Err(BrokerError::task_not_found(task_id));
        }

        info!("任务已终结: {} -> {}", task_id, status);
        self.tasks
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| BrokerError::task_not_found(task_id))
    }

    /// 处理器主动归还任务：processing -> pending，重试计数加一
    pub async fn requeue(
        &self,
        task_id: &str,
        processor_id: &str,
        reason: Option<&str>,
    ) -> BrokerResult<()> {
        let hit = self
            .tasks
            .requeue(task_id, processor_id, reason, now_ms())
            .await?;
        if !hit {
            return Err(BrokerError::task_not_found(task_id));
        }
        info!(
            "任务 {} 由处理器 {} 归还队列, 原因: {:?}",
            task_id, processor_id, reason
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_events::{Subscriber, SubscriberKind};
    use broker_testing_utils::TestStore;

    fn service(store: &TestStore) -> (TaskLifecycleService, Arc<SubscriberRegistry>) {
        let registry = Arc::new(SubscriberRegistry::new());
        let admission = Arc::new(AdmissionService::new(
            store.rate_limits.clone(),
            RateLimitSettings::default(),
        ));
        (
            TaskLifecycleService::new(store.tasks.clone(), admission, Arc::clone(&registry)),
            registry,
        )
    }

    fn create_input(user_id: &str) -> CreateTaskInput {
        CreateTaskInput {
            user_id: user_id.to_string(),
            product_data: "product".to_string(),
            priority: 0,
            ollama_params: None,
            rate_limit: None,
        }
    }

    #[tokio::test]
    async fn test_create_then_complete_then_read_back() {
        let store = TestStore::new().await;
        let (lifecycle, _registry) = service(&store);

        let task = lifecycle
            .create_task(create_input("u-1"))
            .await
            .expect("create");
        assert_eq!(task.status, TaskStatus::Pending);

        let now = now_ms();
        assert!(store
            .tasks
            .try_claim(&task.id, "p-1", now, now + 300_000)
            .await
            .expect("claim"));

        let finished = lifecycle
            .complete(&task.id, TaskStatus::Completed, Some("Y"), None, Some("p-1"))
            .await
            .expect("complete");
        assert_eq!(finished.status, TaskStatus::Completed);
        assert_eq!(finished.result.as_deref(), Some("Y"));
        assert!(finished.rating.is_none());
    }

    #[tokio::test]
    async fn test_create_pushes_to_processor_subscribers() {
        let store = TestStore::new().await;
        let (lifecycle, registry) = service(&store);

        let (subscriber, mut rx) = Subscriber::new(SubscriberKind::Processor {
            processor_id: "p-1".to_string(),
        });
        registry.add(Arc::new(subscriber)).await;

        let task = lifecycle
            .create_task(create_input("u-1"))
            .await
            .expect("create");

        let event = rx.recv().await.expect("push delivered");
        assert_eq!(event.data["taskId"], task.id);
    }

    #[tokio::test]
    async fn test_duplicate_active_task_rejected() {
        let store = TestStore::new().await;
        let (lifecycle, _registry) = service(&store);

        lifecycle
            .create_task(create_input("u-1"))
            .await
            .expect("first create");
        match lifecycle.create_task(create_input("u-1")).await {
            Err(BrokerError::ActiveTaskExists { .. }) => {}
            other => panic!("expected ActiveTaskExists, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_not_owner_is_not_found() {
        let store = TestStore::new().await;
        let (lifecycle, _registry) = service(&store);

        let task = lifecycle
            .create_task(create_input("u-1"))
            .await
            .expect("create");
        let now = now_ms();
        store
            .tasks
            .try_claim(&task.id, "p-1", now, now + 300_000)
            .await
            .expect("claim");

        match lifecycle.heartbeat(&task.id, "p-2").await {
            Err(BrokerError::TaskNotFound { .. }) => {}
            other => panic!("expected TaskNotFound, got {other:?}"),
        }
        // 状态未被改动
        let loaded = store
            .tasks
            .get_by_id(&task.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded.heartbeat_at, Some(now));
    }

    #[tokio::test]
    async fn test_complete_rejects_non_terminal_status() {
        let store = TestStore::new().await;
        let (lifecycle, _registry) = service(&store);

        let task = lifecycle
            .create_task(create_input("u-1"))
            .await
            .expect("create");
        match lifecycle
            .complete(&task.id, TaskStatus::Processing, None, None, None)
            .await
        {
            Err(BrokerError::Validation(_)) => {}
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_requeue_owner_scoped() {
        let store = TestStore::new().await;
        let (lifecycle, _registry) = service(&store);

        let task = lifecycle
            .create_task(create_input("u-1"))
            .await
            .expect("create");
        let now = now_ms();
        store
            .tasks
            .try_claim(&task.id, "p-1", now, now + 300_000)
            .await
            .expect("claim");

        assert!(lifecycle.requeue(&task.id, "p-2", Some("nope")).await.is_err());
        lifecycle
            .requeue(&task.id, "p-1", Some("maintenance"))
            .await
            .expect("owner requeue");

        let loaded = store
            .tasks
            .get_by_id(&task.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.retry_count, 1);
    }
}
