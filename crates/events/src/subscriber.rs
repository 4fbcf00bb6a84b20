//! 订阅者
//!
//! 订阅者不持久化。每个订阅者一个带界邮箱和一个完成信号；
//! 发送永远是非阻塞的，邮箱满即丢弃。

use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use broker_common::constants::SUBSCRIBER_MAILBOX_CAPACITY;

use crate::event::StreamEvent;

/// 订阅者类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberKind {
    /// 用户关注自己的一个任务
    UserTask { user_id: String, task_id: String },
    /// 处理器关注待处理池
    Processor { processor_id: String },
}

impl SubscriberKind {
    pub fn is_processor(&self) -> bool {
        matches!(self, SubscriberKind::Processor { .. })
    }
}

/// 订阅者句柄
///
/// 注册表持有发送端；接收端交给传输层的分发循环独占。
pub struct Subscriber {
    pub id: String,
    pub kind: SubscriberKind,
    sender: mpsc::Sender<StreamEvent>,
    done: broadcast::Sender<()>,
}

impl Subscriber {
    /// 创建订阅者，返回句柄与邮箱接收端
    pub fn new(kind: SubscriberKind) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_MAILBOX_CAPACITY);
        let (done, _) = broadcast::channel(1);

        (
            Self {
                id: Uuid::new_v4().to_string(),
                kind,
                sender,
                done,
            },
            receiver,
        )
    }

    /// 非阻塞投递，返回是否成功入箱
    pub fn try_send(&self, event: StreamEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("订阅者 {} 邮箱已满，事件丢弃", self.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// 订阅完成信号；信号触发后所有协作循环应当退出
    pub fn done_signal(&self) -> broadcast::Receiver<()> {
        self.done.subscribe()
    }

    /// 发出完成信号
    pub fn close(&self) {
        let _ = self.done.send(());
    }

    /// 发送端克隆，供订阅者自己的协作循环使用
    pub fn sender(&self) -> mpsc::Sender<StreamEvent> {
        self.sender.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_predicates() {
        let user = SubscriberKind::UserTask {
            user_id: "u-1".to_string(),
            task_id: "t-1".to_string(),
        };
        let processor = SubscriberKind::Processor {
            processor_id: "p-1".to_string(),
        };

        assert!(!user.is_processor());
        assert!(processor.is_processor());
    }

    #[tokio::test]
    async fn test_mailbox_drops_when_full() {
        let (subscriber, mut receiver) = Subscriber::new(SubscriberKind::Processor {
            processor_id: "p-1".to_string(),
        });

        // 填满容量为10的邮箱
        for _ in 0..10 {
            assert!(subscriber.try_send(StreamEvent::heartbeat(json!({}))));
        }
        // 第11个被丢弃
        assert!(!subscriber.try_send(StreamEvent::heartbeat(json!({}))));

        // 腾出一格后恢复投递
        receiver.recv().await.expect("drain one");
        assert!(subscriber.try_send(StreamEvent::heartbeat(json!({}))));
    }

    #[tokio::test]
    async fn test_done_signal_reaches_all_loops() {
        let (subscriber, _receiver) = Subscriber::new(SubscriberKind::Processor {
            processor_id: "p-1".to_string(),
        });

        let mut first = subscriber.done_signal();
        let mut second = subscriber.done_signal();
        subscriber.close();

        first.recv().await.expect("first loop signalled");
        second.recv().await.expect("second loop signalled");
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let (subscriber, receiver) = Subscriber::new(SubscriberKind::Processor {
            processor_id: "p-1".to_string(),
        });
        drop(receiver);
        assert!(!subscriber.try_send(StreamEvent::heartbeat(json!({}))));
    }
}
