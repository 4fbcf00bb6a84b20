//! 路由与应用状态

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;

use broker_config::AppConfig;
use broker_dispatcher::{DispatchService, TaskLifecycleService, WaitTimeEstimator};
use broker_domain::repositories::{
    MetricsRepository, RateLimitRepository, RatingRepository, TaskRepository,
};
use broker_events::SubscriberRegistry;
use broker_infrastructure::CleanupService;

use crate::auth::{ApiKeyValidator, TokenService};
use crate::handlers::{internal, public, stream};
use crate::middleware::{api_key_middleware, cors_layer, request_logging, trace_layer};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub tokens: Arc<TokenService>,
    pub api_keys: Arc<ApiKeyValidator>,
    pub tasks: Arc<dyn TaskRepository>,
    pub rate_limits: Arc<dyn RateLimitRepository>,
    pub metrics: Arc<dyn MetricsRepository>,
    pub ratings: Arc<dyn RatingRepository>,
    pub lifecycle: Arc<TaskLifecycleService>,
    pub dispatch: Arc<DispatchService>,
    pub estimator: Arc<WaitTimeEstimator>,
    pub cleanup: Arc<CleanupService>,
    pub registry: Arc<SubscriberRegistry>,
}

/// 组装完整的HTTP应用
pub fn create_app(state: AppState) -> Router {
    let internal_routes = Router::new()
        .route("/tasks", get(internal::get_pending_tasks))
        .route("/all-tasks", get(internal::get_all_tasks))
        .route("/claim", post(internal::claim_tasks))
        .route("/heartbeat", post(internal::heartbeat))
        .route("/processor-heartbeat", post(internal::processor_heartbeat))
        .route("/complete", post(internal::complete_task))
        .route("/requeue", post(internal::requeue_task))
        .route("/work-steal", post(internal::work_steal))
        .route("/cleanup", post(internal::cleanup))
        .route("/cleanup/stats", get(internal::cleanup_stats))
        .route("/metrics", get(internal::processor_metrics))
        .route("/estimated-time", get(internal::estimated_time))
        .route("/generate-token", post(internal::generate_token))
        .route("/rating-stats", get(internal::rating_stats))
        .route("/rating-analytics", get(internal::rating_analytics))
        .route("/task-stream", get(stream::task_stream))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ));

    Router::new()
        .route("/", get(public::health_check))
        .route("/health", get(public::health_check))
        .route("/api/create", post(public::create_task))
        .route("/api/result", post(public::get_result))
        .route("/api/get", get(public::get_user_data))
        .route("/api/tasks/vote", post(public::vote_task))
        .route("/api/result-polling", get(stream::result_polling))
        .nest("/api/internal", internal_routes)
        .layer(
            ServiceBuilder::new()
                .layer(trace_layer())
                .layer(cors_layer())
                .layer(middleware::from_fn(request_logging)),
        )
        .with_state(state)
}
