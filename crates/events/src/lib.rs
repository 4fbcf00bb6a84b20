//! # 事件分发
//!
//! 两类订阅者共用同一套结构：带界邮箱（容量10）、完成信号和注册表
//! 登记。广播走注册表读锁与非阻塞发送，邮箱满或已关闭时事件直接
//! 丢弃——推送只是优化，正确性始终由拉取认领兜底。

pub mod event;
pub mod registry;
pub mod subscriber;

pub use event::{EventKind, StreamEvent};
pub use registry::SubscriberRegistry;
pub use subscriber::{Subscriber, SubscriberKind};
