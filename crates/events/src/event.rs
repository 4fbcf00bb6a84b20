//! 流事件模型
//!
//! 每个事件在SSE线路上是一帧 `data: <json>`，JSON结构固定为
//! `{type, data, timestamp}`。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use broker_common::time::now_ms;
use broker_domain::entities::Task;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStatus,
    TaskCompleted,
    TaskFailed,
    Heartbeat,
    Error,
    TaskAvailable,
    /// 预留
    ProcessorMetrics,
}

/// 流事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
    pub timestamp: i64,
}

impl StreamEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: now_ms(),
        }
    }

    pub fn heartbeat(data: Value) -> Self {
        Self::new(EventKind::Heartbeat, data)
    }

    /// 新待处理任务对处理器的通知载荷
    pub fn task_available(task: &Task) -> Self {
        Self::new(
            EventKind::TaskAvailable,
            json!({
                "taskId": task.id,
                "priority": task.priority,
                "productData": task.product_data,
                "ollamaParams": task.ollama_params,
            }),
        )
    }

    /// 带重连提示的错误事件
    pub fn error_with_reconnect(data: Value) -> Self {
        let mut data = data;
        if let Value::Object(ref mut map) = data {
            map.entry("shouldReconnect").or_insert(json!(true));
            map.entry("reconnectDelay").or_insert(json!(1000));
        }
        Self::new(EventKind::Error, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = StreamEvent::heartbeat(json!({"message": "connected"}));
        let value = serde_json::to_value(&event).expect("serialize");

        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["data"]["message"], "connected");
        assert!(value["timestamp"].as_i64().expect("timestamp present") > 0);
    }

    #[test]
    fn test_event_kind_names() {
        for (kind, name) in [
            (EventKind::TaskStatus, "task_status"),
            (EventKind::TaskCompleted, "task_completed"),
            (EventKind::TaskFailed, "task_failed"),
            (EventKind::Heartbeat, "heartbeat"),
            (EventKind::Error, "error"),
            (EventKind::TaskAvailable, "task_available"),
            (EventKind::ProcessorMetrics, "processor_metrics"),
        ] {
            assert_eq!(serde_json::to_value(kind).expect("serialize"), name);
        }
    }

    #[test]
    fn test_error_event_gets_reconnect_hint() {
        let event = StreamEvent::error_with_reconnect(json!({"error": "Polling timeout exceeded"}));
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["data"]["shouldReconnect"], true);
        assert_eq!(value["data"]["reconnectDelay"], 1000);
    }

    #[test]
    fn test_task_available_payload() {
        let task = Task::new_pending("u-1", "some product", 3, 0);
        let event = StreamEvent::task_available(&task);
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "task_available");
        assert_eq!(value["data"]["taskId"], task.id);
        assert_eq!(value["data"]["priority"], 3);
        assert_eq!(value["data"]["productData"], "some product");
    }
}
