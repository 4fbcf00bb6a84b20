//! 优雅关闭
//!
//! 基于broadcast信号的进程级关闭管理：HTTP服务与后台清理各自订阅，
//! 信号触发后各组件自行收尾。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    is_shutdown: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            is_shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 订阅关闭信号
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// 触发关闭；重复调用是无操作
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            debug!("关闭信号已经触发过");
            return;
        }

        let subscriber_count = self.shutdown_tx.receiver_count();
        info!("发送关闭信号给 {} 个订阅者", subscriber_count);
        // 可能没有接收者，忽略发送错误
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// 等待关闭信号
    pub async fn wait(&self) {
        if self.is_shutdown() {
            return;
        }
        let mut rx = self.subscribe();
        let _ = rx.recv().await;
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_signal_reaches_all_subscribers() {
        let manager = ShutdownManager::new();
        let mut first = manager.subscribe();
        let mut second = manager.subscribe();

        manager.shutdown();

        timeout(Duration::from_millis(100), first.recv())
            .await
            .expect("first notified")
            .expect("recv");
        timeout(Duration::from_millis(100), second.recv())
            .await
            .expect("second notified")
            .expect("recv");
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_double_shutdown_is_noop() {
        let manager = ShutdownManager::new();
        manager.shutdown();
        manager.shutdown();
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_wait_after_shutdown_returns_immediately() {
        let manager = ShutdownManager::new();
        manager.shutdown();
        timeout(Duration::from_millis(100), manager.wait())
            .await
            .expect("wait returns");
    }

    #[tokio::test]
    async fn test_clone_shares_state() {
        let manager = ShutdownManager::new();
        let cloned = manager.clone();
        manager.shutdown();
        assert!(cloned.is_shutdown());
    }
}
