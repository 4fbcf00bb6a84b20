//! 端到端场景测试：完整HTTP应用跑在内存数据库上

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use broker_api::auth::UserTokenSpec;
use broker_api::routes::{create_app, AppState};
use broker_common::time::now_ms;
use broker_config::AppConfig;
use broker_infrastructure::DatabaseManager;
use llm_broker::app::build_state;

async fn test_app() -> (Router, AppState) {
    let config = AppConfig::default();
    let db = DatabaseManager::new_in_memory().await.expect("open db");
    db.migrate().await.expect("migrate");

    let state = build_state(&config, &db);
    (create_app(state.clone()), state)
}

fn api_key(state: &AppState) -> String {
    state.config.auth.internal_api_key.clone()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("send");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn internal_post(state: &AppState, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("X-API-Key", api_key(state))
        .body(Body::from(body.to_string()))
        .expect("build request")
}

async fn create_task_via_api(app: &Router, state: &AppState, user_id: &str) -> (String, String) {
    let token = state
        .tokens
        .issue_user_token(
            user_id,
            UserTokenSpec {
                product_data: Some("X".to_string()),
                ..Default::default()
            },
            None,
        )
        .expect("issue token");

    let request = Request::builder()
        .method("POST")
        .uri("/api/create")
        .header("Authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::empty())
        .expect("build request");
    let (status, body) = send(app, request).await;
    assert_eq!(status, StatusCode::CREATED);

    (
        body["taskId"].as_str().expect("taskId").to_string(),
        body["token"].as_str().expect("result token").to_string(),
    )
}

#[tokio::test]
async fn test_lease_expiry_requeues_task() {
    let (app, state) = test_app().await;
    let (task_id, _) = create_task_via_api(&app, &state, "u-1").await;

    // 认领后心跳停摆超过5分钟
    let stale = now_ms() - 400_000;
    assert!(state
        .tasks
        .try_claim(&task_id, "p-1", stale, stale + 300_000)
        .await
        .expect("claim"));

    let (status, body) = send(&app, internal_post(&state, "/api/internal/cleanup", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleaned"]["timedout"], 1);

    let task = state
        .tasks
        .get_by_id(&task_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(task.status.as_str(), "pending");
    assert!(task.processor_id.is_none());
    assert_eq!(task.retry_count, 1);
    assert!(task
        .error_message
        .as_deref()
        .expect("reason")
        .contains("heartbeat timeout"));
}

#[tokio::test]
async fn test_lease_expiry_exhausted_retries_fails_task() {
    let (app, state) = test_app().await;
    let (task_id, _) = create_task_via_api(&app, &state, "u-1").await;

    let stale = now_ms() - 400_000;
    state
        .tasks
        .try_claim(&task_id, "p-1", stale, stale + 300_000)
        .await
        .expect("claim");
    // 把重试额度耗到retry_count + 1 == max_retries
    state
        .tasks
        .requeue(&task_id, "p-1", Some("first timeout"), stale)
        .await
        .expect("requeue once");
    state
        .tasks
        .try_claim(&task_id, "p-1", stale, stale + 300_000)
        .await
        .expect("re-claim");
    state
        .tasks
        .requeue(&task_id, "p-1", Some("second timeout"), stale)
        .await
        .expect("requeue twice");
    state
        .tasks
        .try_claim(&task_id, "p-1", stale, stale + 300_000)
        .await
        .expect("third claim");

    let (status, body) = send(&app, internal_post(&state, "/api/internal/cleanup", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleaned"]["failed"], 1);

    let task = state
        .tasks
        .get_by_id(&task_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(task.status.as_str(), "failed");
    assert!(task.completed_at.is_some());
    assert!(task
        .error_message
        .as_deref()
        .expect("reason")
        .contains("heartbeat timeout"));
}

#[tokio::test]
async fn test_processor_stream_receives_push_on_create() {
    let (app, state) = test_app().await;

    // 处理器先打开任务流（池为空）
    let request = Request::builder()
        .uri(format!(
            "/api/internal/task-stream?processor_id=p-1&api_key={}",
            api_key(&state)
        ))
        .body(Body::empty())
        .expect("build request");
    let response = app.clone().oneshot(request).await.expect("open stream");
    assert_eq!(response.status(), StatusCode::OK);
    let mut frames = response.into_body().into_data_stream();

    // 用户创建任务
    let (task_id, _) = create_task_via_api(&app, &state, "u-1").await;

    // 处理器应当在一次投递回合内看到task_available
    let mut collected = String::new();
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = frames.next().await {
            let chunk = chunk.expect("chunk");
            collected.push_str(&String::from_utf8_lossy(&chunk));
            if collected.contains("task_available") && collected.contains(&task_id) {
                return;
            }
        }
        panic!("stream ended without task_available");
    })
    .await;
    deadline.expect("task_available within deadline");
    assert!(collected.contains("Connected to task stream"));
}

#[tokio::test]
async fn test_user_stream_observes_completion() {
    let (app, state) = test_app().await;
    let (task_id, result_token) = create_task_via_api(&app, &state, "u-1").await;

    // 任务还在pending时打开结果流，轮询间隔取下限1秒
    let request = Request::builder()
        .uri(format!(
            "/api/result-polling?token={result_token}&pollInterval=1000"
        ))
        .body(Body::empty())
        .expect("build request");
    let response = app.clone().oneshot(request).await.expect("open stream");
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body();

    // 处理器认领并完成任务
    send(
        &app,
        internal_post(
            &state,
            "/api/internal/claim",
            json!({"processor_id": "p-1", "batch_size": 1}),
        ),
    )
    .await;
    send(
        &app,
        internal_post(
            &state,
            "/api/internal/complete",
            json!({"taskId": task_id, "processor_id": "p-1", "status": "completed", "result": "Y"}),
        ),
    )
    .await;

    // 终态事件之后流关闭，整个响应体可以读完
    let bytes = tokio::time::timeout(
        Duration::from_secs(10),
        axum::body::to_bytes(body, usize::MAX),
    )
    .await
    .expect("stream closes after terminal event")
    .expect("collect body");
    let text = String::from_utf8_lossy(&bytes);

    assert!(text.contains("Connected to task polling"));
    assert!(text.contains("task_completed"));
    assert!(text.contains("\"result\":\"Y\""));
    // 终态事件严格在中间状态事件之后
    if let (Some(status_pos), Some(completed_pos)) =
        (text.find("task_status"), text.find("task_completed"))
    {
        assert!(status_pos < completed_pos);
    }
}

#[tokio::test]
async fn test_reaper_endpoint_converges() {
    let (app, state) = test_app().await;
    let (task_id, _) = create_task_via_api(&app, &state, "u-1").await;

    let stale = now_ms() - 400_000;
    state
        .tasks
        .try_claim(&task_id, "p-1", stale, stale + 300_000)
        .await
        .expect("claim");

    send(&app, internal_post(&state, "/api/internal/cleanup", json!({}))).await;
    let after_first = state
        .tasks
        .get_by_id(&task_id)
        .await
        .expect("get")
        .expect("present");

    // 第二轮没有新动作，状态收敛
    let (_, body) = send(&app, internal_post(&state, "/api/internal/cleanup", json!({}))).await;
    assert_eq!(body["cleaned"]["timedout"], 0);
    assert_eq!(body["cleaned"]["failed"], 0);
    let after_second = state
        .tasks
        .get_by_id(&task_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(after_first.retry_count, after_second.retry_count);
    assert_eq!(after_first.updated_at, after_second.updated_at);
}
