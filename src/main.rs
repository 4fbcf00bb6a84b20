use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use llm_broker::{Application, ShutdownManager};

#[derive(Debug, Parser)]
#[command(name = "llm-broker", version, about = "LLM任务分发服务")]
struct Cli {
    /// TOML配置文件路径
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 监听地址，覆盖配置文件
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// 监听端口，覆盖配置文件
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// SQLite数据库路径，覆盖配置文件
    #[arg(long, env = "DB_PATH")]
    db_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mut config = broker_config::AppConfig::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(db_path) = cli.db_path {
        config.database.path = db_path;
    }

    info!(
        "llm-broker 启动, 监听 {}, 数据库 {}",
        config.server.bind_address(),
        config.database.path
    );

    let app = Application::new(config).await?;
    let shutdown = ShutdownManager::new();

    // 信号处理：SIGINT / SIGTERM都触发优雅关闭
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("监听SIGINT失败: {}", e);
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => error!("监听SIGTERM失败: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("收到SIGINT"),
            _ = terminate => info!("收到SIGTERM"),
        }

        signal_shutdown.shutdown();
    });

    app.run(shutdown).await
}
