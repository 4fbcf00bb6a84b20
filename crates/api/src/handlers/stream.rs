//! SSE事件流
//!
//! 每个订阅对应三个协作循环：轮询/扫描循环、心跳循环，以及由
//! `KeepAlive`承担的25秒协议层注释帧。分发循环就是响应流本身，
//! 邮箱发送端全部释放后流结束、连接关闭。订阅者在连接断开时通过
//! RAII守卫从注册表移除。

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, HeaderName, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use broker_common::constants::{
    INITIAL_PENDING_SCAN_LIMIT, KEEPALIVE_INTERVAL_SECS, POLL_INTERVAL_DEFAULT_MS,
    POLL_INTERVAL_MAX_MS, POLL_INTERVAL_MIN_MS, PROCESSOR_STREAM_MAX_DEFAULT_MS,
    PROCESSOR_STREAM_MAX_MAX_MS, PROCESSOR_STREAM_MAX_MIN_MS, STREAM_CLOSE_GRACE_MS,
    STREAM_HEARTBEAT_DEFAULT_MS, STREAM_HEARTBEAT_MAX_MS, STREAM_HEARTBEAT_MIN_MS,
    USER_STREAM_MAX_DEFAULT_MS, USER_STREAM_MAX_MAX_MS, USER_STREAM_MAX_MIN_MS,
};
use broker_common::time::{format_ms, format_ms_opt, now_ms};
use broker_common::types::clamp_param;
use broker_domain::entities::{Task, TaskStatus};
use broker_domain::repositories::TaskRepository;
use broker_errors::BrokerError;
use broker_events::{EventKind, StreamEvent, Subscriber, SubscriberKind, SubscriberRegistry};

use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

/// 连接断开（流被丢弃）时从注册表摘除订阅者
struct RegistryGuard {
    registry: Arc<SubscriberRegistry>,
    subscriber_id: String,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        let registry = Arc::clone(&self.registry);
        let id = self.subscriber_id.clone();
        tokio::spawn(async move {
            registry.remove(&id).await;
        });
    }
}

fn sse_frame(event: &StreamEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()))
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS))
        .text("ping")
}

/// SSE响应要求禁用缓存与反向代理缓冲
fn sse_response<S>(sse: Sse<S>) -> Response
where
    S: futures::Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    let mut response = sse.into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );
    response.headers_mut().insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

fn mailbox_stream(receiver: mpsc::Receiver<StreamEvent>, guard: RegistryGuard) -> EventStream {
    ReceiverStream::new(receiver)
        .map(move |event| {
            let _connected = &guard;
            Ok(sse_frame(&event))
        })
        .boxed()
}

fn terminal_event(task: &Task) -> StreamEvent {
    if task.status == TaskStatus::Completed {
        StreamEvent::new(
            EventKind::TaskCompleted,
            json!({
                "taskId": task.id,
                "status": task.status,
                "result": task.result,
                "rating": task.rating,
                "createdAt": format_ms(task.created_at),
                "completedAt": format_ms_opt(task.completed_at),
            }),
        )
    } else {
        StreamEvent::new(
            EventKind::TaskFailed,
            json!({
                "taskId": task.id,
                "status": task.status,
                "error": task.error_message,
                "createdAt": format_ms(task.created_at),
                "completedAt": format_ms_opt(task.completed_at),
            }),
        )
    }
}

fn status_event(task: &Task) -> StreamEvent {
    StreamEvent::new(
        EventKind::TaskStatus,
        json!({
            "taskId": task.id,
            "status": task.status,
            "createdAt": format_ms(task.created_at),
            "updatedAt": format_ms(task.updated_at),
            "processingStartedAt": format_ms_opt(task.processing_started_at),
        }),
    )
}

#[derive(Debug, Deserialize)]
pub struct ResultPollingParams {
    pub token: Option<String>,
    #[serde(rename = "pollInterval")]
    pub poll_interval: Option<u64>,
    #[serde(rename = "heartbeatInterval")]
    pub heartbeat_interval: Option<u64>,
    #[serde(rename = "maxDuration")]
    pub max_duration: Option<u64>,
}

/// GET /api/result-polling - 用户关注单个任务的结果流
pub async fn result_polling(
    State(state): State<AppState>,
    Query(params): Query<ResultPollingParams>,
) -> ApiResult<Response> {
    let token = params
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing token parameter".to_string()))?;
    let claims = state.tokens.verify(&token)?;

    let user_id = claims
        .resolved_user_id()
        .map(str::to_string)
        .filter(|u| !u.is_empty());
    let task_id = claims.task_id.clone().filter(|t| !t.is_empty());
    let (user_id, task_id) = match (user_id, task_id) {
        (Some(user_id), Some(task_id)) => (user_id, task_id),
        _ => {
            return Err(ApiError::BadRequest(
                "Invalid token: missing user_id or taskId".to_string(),
            ))
        }
    };

    let task = state
        .tasks
        .get_by_id(&task_id)
        .await?
        .ok_or_else(|| BrokerError::task_not_found(&task_id))?;
    if task.user_id != user_id {
        return Err(BrokerError::Forbidden.into());
    }

    // 已终结的任务直接发一帧结果并关闭
    if task.is_terminal() {
        let frame = sse_frame(&terminal_event(&task));
        let immediate = stream::iter([Ok::<Event, Infallible>(frame)]).boxed();
        return Ok(sse_response(Sse::new(immediate).keep_alive(keep_alive())));
    }

    let poll_interval = Duration::from_millis(clamp_param(
        params.poll_interval,
        POLL_INTERVAL_DEFAULT_MS,
        POLL_INTERVAL_MIN_MS,
        POLL_INTERVAL_MAX_MS,
    ));
    let heartbeat_interval = Duration::from_millis(clamp_param(
        params.heartbeat_interval,
        STREAM_HEARTBEAT_DEFAULT_MS,
        STREAM_HEARTBEAT_MIN_MS,
        STREAM_HEARTBEAT_MAX_MS,
    ));
    let max_duration = Duration::from_millis(clamp_param(
        params.max_duration,
        USER_STREAM_MAX_DEFAULT_MS,
        USER_STREAM_MAX_MIN_MS,
        USER_STREAM_MAX_MAX_MS,
    ));

    let (subscriber, receiver) = Subscriber::new(SubscriberKind::UserTask {
        user_id,
        task_id: task_id.clone(),
    });
    let subscriber = Arc::new(subscriber);
    let guard = RegistryGuard {
        registry: Arc::clone(&state.registry),
        subscriber_id: subscriber.id.clone(),
    };
    state.registry.add(Arc::clone(&subscriber)).await;

    subscriber.try_send(StreamEvent::heartbeat(json!({
        "message": "Connected to task polling",
        "taskId": task_id,
    })));

    tokio::spawn(poll_task_status(
        state.tasks.clone(),
        Arc::clone(&state.registry),
        Arc::clone(&subscriber),
        task_id.clone(),
        poll_interval,
        max_duration,
    ));
    tokio::spawn(user_stream_heartbeats(
        Arc::clone(&subscriber),
        task_id,
        heartbeat_interval,
        max_duration,
    ));

    Ok(sse_response(Sse::new(mailbox_stream(receiver, guard)).keep_alive(keep_alive())))
}

/// 轮询循环：状态变化时发事件，见到终态后收尾并关闭订阅
async fn poll_task_status(
    tasks: Arc<dyn TaskRepository>,
    registry: Arc<SubscriberRegistry>,
    subscriber: Arc<Subscriber>,
    task_id: String,
    poll_interval: Duration,
    max_duration: Duration,
) {
    let started = Instant::now();
    let mut ticker = interval(poll_interval);
    ticker.tick().await;
    let mut done = subscriber.done_signal();
    let mut last_status: Option<TaskStatus> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if started.elapsed() > max_duration {
                    subscriber.try_send(StreamEvent::error_with_reconnect(json!({
                        "error": "Polling timeout exceeded",
                        "maxDuration": max_duration.as_millis() as u64,
                        "taskId": task_id,
                    })));
                    registry.remove(&subscriber.id).await;
                    return;
                }

                let task = match tasks.get_by_id(&task_id).await {
                    Ok(Some(task)) => task,
                    Ok(None) => {
                        warn!("轮询中任务消失: {}", task_id);
                        subscriber.try_send(StreamEvent::error_with_reconnect(json!({
                            "error": "Task not found during polling",
                            "taskId": task_id,
                        })));
                        registry.remove(&subscriber.id).await;
                        return;
                    }
                    Err(e) => {
                        warn!("轮询任务 {} 出错: {}", task_id, e);
                        subscriber.try_send(StreamEvent::error_with_reconnect(json!({
                            "error": "Database error during polling",
                            "taskId": task_id,
                        })));
                        registry.remove(&subscriber.id).await;
                        return;
                    }
                };

                if last_status != Some(task.status) {
                    last_status = Some(task.status);

                    if task.is_terminal() {
                        subscriber.try_send(terminal_event(&task));
                        // 终态后补一个心跳帧，留出冲刷缓冲的宽限再关闭
                        subscriber.try_send(StreamEvent::heartbeat(json!({
                            "message": "Final heartbeat before close",
                            "taskId": task_id,
                        })));
                        tokio::time::sleep(Duration::from_millis(STREAM_CLOSE_GRACE_MS)).await;
                        registry.remove(&subscriber.id).await;
                        return;
                    }

                    subscriber.try_send(status_event(&task));
                }
            }
            _ = done.recv() => {
                debug!("任务 {} 的轮询循环收到完成信号", task_id);
                return;
            }
        }
    }
}

/// 用户流心跳循环，完成信号或时长上限时退出
async fn user_stream_heartbeats(
    subscriber: Arc<Subscriber>,
    task_id: String,
    heartbeat_interval: Duration,
    max_duration: Duration,
) {
    let started = Instant::now();
    let mut ticker = interval(heartbeat_interval);
    ticker.tick().await;
    let mut done = subscriber.done_signal();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if started.elapsed() > max_duration {
                    return;
                }
                subscriber.try_send(StreamEvent::heartbeat(json!({
                    "timestamp": now_ms(),
                    "taskId": task_id,
                })));
            }
            _ = done.recv() => return,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TaskStreamParams {
    pub processor_id: Option<String>,
    pub heartbeat: Option<u64>,
    #[serde(rename = "maxDuration")]
    pub max_duration: Option<u64>,
}

/// GET /api/internal/task-stream - 处理器关注待处理池的事件流
pub async fn task_stream(
    State(state): State<AppState>,
    Query(params): Query<TaskStreamParams>,
) -> ApiResult<Response> {
    let processor_id = params
        .processor_id
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing processor_id parameter".to_string()))?;

    let heartbeat_interval = Duration::from_millis(clamp_param(
        params.heartbeat,
        STREAM_HEARTBEAT_DEFAULT_MS,
        STREAM_HEARTBEAT_MIN_MS,
        STREAM_HEARTBEAT_MAX_MS,
    ));
    let max_duration = Duration::from_millis(clamp_param(
        params.max_duration,
        PROCESSOR_STREAM_MAX_DEFAULT_MS,
        PROCESSOR_STREAM_MAX_MIN_MS,
        PROCESSOR_STREAM_MAX_MAX_MS,
    ));

    let (subscriber, receiver) = Subscriber::new(SubscriberKind::Processor {
        processor_id: processor_id.clone(),
    });
    let subscriber = Arc::new(subscriber);
    let guard = RegistryGuard {
        registry: Arc::clone(&state.registry),
        subscriber_id: subscriber.id.clone(),
    };
    state.registry.add(Arc::clone(&subscriber)).await;
    info!("处理器 {} 建立任务流连接", processor_id);

    subscriber.try_send(StreamEvent::heartbeat(json!({
        "message": "Connected to task stream",
        "processorId": processor_id,
        "reconnectDelay": 5000,
    })));

    tokio::spawn(scan_pending_tasks(
        state.tasks.clone(),
        Arc::clone(&subscriber),
    ));
    tokio::spawn(processor_stream_heartbeats(
        Arc::clone(&state.registry),
        Arc::clone(&subscriber),
        processor_id,
        heartbeat_interval,
        max_duration,
    ));

    Ok(sse_response(Sse::new(mailbox_stream(receiver, guard)).keep_alive(keep_alive())))
}

/// 订阅建立时把当前待处理页推给处理器
async fn scan_pending_tasks(tasks: Arc<dyn TaskRepository>, subscriber: Arc<Subscriber>) {
    let pending = match tasks.pending_page(INITIAL_PENDING_SCAN_LIMIT).await {
        Ok(pending) => pending,
        Err(e) => {
            warn!("扫描待处理任务失败: {}", e);
            return;
        }
    };

    for task in &pending {
        subscriber.try_send(StreamEvent::task_available(task));
    }
}

/// 处理器流心跳循环，超过时长上限时发错误事件并关闭
async fn processor_stream_heartbeats(
    registry: Arc<SubscriberRegistry>,
    subscriber: Arc<Subscriber>,
    processor_id: String,
    heartbeat_interval: Duration,
    max_duration: Duration,
) {
    let started = Instant::now();
    let mut ticker = interval(heartbeat_interval);
    ticker.tick().await;
    let mut done = subscriber.done_signal();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if started.elapsed() > max_duration {
                    subscriber.try_send(StreamEvent::new(
                        EventKind::Error,
                        json!({
                            "error": "Connection timeout exceeded",
                            "maxDuration": max_duration.as_millis() as u64,
                            "processorId": processor_id,
                        }),
                    ));
                    registry.remove(&subscriber.id).await;
                    return;
                }

                subscriber.try_send(StreamEvent::heartbeat(json!({
                    "processorId": processor_id,
                    "uptime": started.elapsed().as_millis() as u64,
                })));
            }
            _ = done.recv() => {
                debug!("处理器 {} 的心跳循环收到完成信号", processor_id);
                return;
            }
        }
    }
}
