//! 应用装配
//!
//! 打开数据库、执行迁移、装配仓储与服务，然后带优雅关闭地运行
//! HTTP服务和后台清理。

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use broker_api::auth::{ApiKeyValidator, TokenService};
use broker_api::routes::{create_app, AppState};
use broker_common::types::RateLimitSettings;
use broker_config::AppConfig;
use broker_dispatcher::{
    AdmissionService, DispatchService, TaskLifecycleService, WaitTimeEstimator,
};
use broker_events::SubscriberRegistry;
use broker_infrastructure::reaper::spawn_sweeper;
use broker_infrastructure::{
    CleanupService, CleanupServiceConfig, DatabaseManager, SqliteMetricsRepository,
    SqliteRateLimitRepository, SqliteRatingRepository, SqliteTaskRepository,
};

use crate::shutdown::ShutdownManager;

/// 主应用
pub struct Application {
    config: AppConfig,
    state: AppState,
    db: DatabaseManager,
}

impl Application {
    /// 装配应用：打开数据库并构建完整的服务图
    pub async fn new(config: AppConfig) -> Result<Self> {
        let db = DatabaseManager::new(&config.database)
            .await
            .context("打开数据库失败")?;
        db.migrate().await.context("数据库迁移失败")?;

        let state = build_state(&config, &db);

        Ok(Self { config, state, db })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// 运行HTTP服务与后台清理，直到收到关闭信号
    pub async fn run(&self, shutdown: ShutdownManager) -> Result<()> {
        let cleanup_config = CleanupServiceConfig {
            enabled: self.config.cleanup.enabled,
            interval_seconds: self.config.cleanup.interval_seconds,
            retention_ms: self.config.cleanup.retention_days * 24 * 60 * 60 * 1000,
            ..CleanupServiceConfig::default()
        };
        let sweeper = spawn_sweeper(
            Arc::clone(&self.state.cleanup),
            cleanup_config,
            shutdown.subscribe(),
        );

        let bind_address = self.config.server.bind_address();
        let listener = TcpListener::bind(&bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {bind_address}"))?;
        info!("HTTP服务启动: {}", bind_address);

        let app = create_app(self.state.clone());
        let server_shutdown = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                server_shutdown.wait().await;
                info!("HTTP服务开始优雅关闭");
            })
            .await
            .context("HTTP服务异常退出")?;

        // 驱散事件订阅者，等后台清理退出，最后关数据库
        self.state.registry.shutdown().await;
        let _ = sweeper.await;
        self.db.close().await;
        info!("应用已停止");

        Ok(())
    }
}

/// 从配置与数据库构建应用状态
pub fn build_state(config: &AppConfig, db: &DatabaseManager) -> AppState {
    let tasks = Arc::new(SqliteTaskRepository::new(db.pool(), db.gate()));
    let rate_limits = Arc::new(SqliteRateLimitRepository::new(db.pool(), db.gate()));
    let metrics = Arc::new(SqliteMetricsRepository::new(db.pool(), db.gate()));
    let ratings = Arc::new(SqliteRatingRepository::new(db.pool(), db.gate()));

    let tokens = Arc::new(TokenService::new(
        &config.auth.jwt_secret,
        config.auth.token_ttl_seconds,
    ));
    let api_keys = Arc::new(ApiKeyValidator::new(&config.auth.internal_api_key));
    let registry = Arc::new(SubscriberRegistry::new());

    let admission = Arc::new(AdmissionService::new(
        rate_limits.clone(),
        RateLimitSettings {
            max_requests: config.rate_limit.max_requests,
            window_ms: config.rate_limit.window_ms,
        },
    ));
    let lifecycle = Arc::new(TaskLifecycleService::new(
        tasks.clone(),
        admission,
        Arc::clone(&registry),
    ));
    let dispatch = Arc::new(DispatchService::new(tasks.clone()));
    let estimator = Arc::new(WaitTimeEstimator::new(tasks.clone(), metrics.clone()));
    let cleanup = Arc::new(CleanupService::new(
        tasks.clone(),
        rate_limits.clone(),
        metrics.clone(),
        CleanupServiceConfig {
            enabled: config.cleanup.enabled,
            interval_seconds: config.cleanup.interval_seconds,
            retention_ms: config.cleanup.retention_days * 24 * 60 * 60 * 1000,
            ..CleanupServiceConfig::default()
        },
    ));

    AppState {
        config: Arc::new(config.clone()),
        tokens,
        api_keys,
        tasks,
        rate_limits,
        metrics,
        ratings,
        lifecycle,
        dispatch,
        estimator,
        cleanup,
        registry,
    }
}
