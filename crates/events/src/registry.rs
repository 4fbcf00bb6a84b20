//! 订阅者注册表
//!
//! 进程级注册表：添加/移除走写锁，广播走读锁。实体之间只以ID互相
//! 引用。`shutdown`在优雅停机时统一驱散所有订阅者。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use broker_domain::entities::Task;

use crate::event::StreamEvent;
use crate::subscriber::Subscriber;

pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<String, Arc<Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add(&self, subscriber: Arc<Subscriber>) {
        let mut subscribers = self.subscribers.write().await;
        debug!("订阅者注册: {} ({:?})", subscriber.id, subscriber.kind);
        subscribers.insert(subscriber.id.clone(), subscriber);
    }

    /// 移除并关闭订阅者；重复移除是无操作
    pub async fn remove(&self, subscriber_id: &str) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(subscriber) = subscribers.remove(subscriber_id) {
            subscriber.close();
            debug!("订阅者移除: {}", subscriber_id);
        }
    }

    pub async fn count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// 新待处理任务广播给所有处理器订阅者，尽力投递
    pub async fn broadcast_task_available(&self, task: &Task) -> usize {
        let subscribers = self.subscribers.read().await;
        let mut delivered = 0;
        for subscriber in subscribers.values() {
            if subscriber.kind.is_processor() && subscriber.try_send(StreamEvent::task_available(task))
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// 驱散所有订阅者，优雅停机用
    pub async fn shutdown(&self) {
        let mut subscribers = self.subscribers.write().await;
        let count = subscribers.len();
        for subscriber in subscribers.values() {
            subscriber.close();
        }
        subscribers.clear();
        if count > 0 {
            info!("事件注册表已关闭，驱散 {} 个订阅者", count);
        }
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::subscriber::SubscriberKind;

    fn processor_subscriber(id: &str) -> (Arc<Subscriber>, tokio::sync::mpsc::Receiver<StreamEvent>)
    {
        let (subscriber, receiver) = Subscriber::new(SubscriberKind::Processor {
            processor_id: id.to_string(),
        });
        (Arc::new(subscriber), receiver)
    }

    #[tokio::test]
    async fn test_task_available_reaches_processors_only() {
        let registry = SubscriberRegistry::new();

        let (processor, mut processor_rx) = processor_subscriber("p-1");
        let (user, mut user_rx) = Subscriber::new(SubscriberKind::UserTask {
            user_id: "u-1".to_string(),
            task_id: "t-1".to_string(),
        });
        let user = Arc::new(user);

        registry.add(Arc::clone(&processor)).await;
        registry.add(Arc::clone(&user)).await;

        let task = Task::new_pending("u-2", "data", 0, 0);
        let delivered = registry.broadcast_task_available(&task).await;
        assert_eq!(delivered, 1);

        let event = processor_rx.recv().await.expect("processor notified");
        assert_eq!(event.kind, EventKind::TaskAvailable);
        assert_eq!(event.data["taskId"], task.id);

        assert!(user_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_mailbox_is_skipped_not_blocked() {
        let registry = SubscriberRegistry::new();
        let (processor, _rx) = processor_subscriber("p-1");
        registry.add(Arc::clone(&processor)).await;

        let task = Task::new_pending("u-1", "data", 0, 0);
        // 前10次填满邮箱，之后投递数为0
        for _ in 0..10 {
            assert_eq!(registry.broadcast_task_available(&task).await, 1);
        }
        assert_eq!(registry.broadcast_task_available(&task).await, 0);
    }

    #[tokio::test]
    async fn test_remove_closes_subscriber() {
        let registry = SubscriberRegistry::new();
        let (processor, _rx) = processor_subscriber("p-1");
        let mut done = processor.done_signal();
        let id = processor.id.clone();

        registry.add(processor).await;
        assert_eq!(registry.count().await, 1);

        registry.remove(&id).await;
        assert_eq!(registry.count().await, 0);
        done.recv().await.expect("done signalled on remove");

        // 重复移除无事发生
        registry.remove(&id).await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_everyone() {
        let registry = SubscriberRegistry::new();
        let (first, _rx1) = processor_subscriber("p-1");
        let (second, _rx2) = processor_subscriber("p-2");
        let mut first_done = first.done_signal();
        let mut second_done = second.done_signal();

        registry.add(first).await;
        registry.add(second).await;

        registry.shutdown().await;
        assert_eq!(registry.count().await, 0);
        first_done.recv().await.expect("first drained");
        second_done.recv().await.expect("second drained");
    }
}
