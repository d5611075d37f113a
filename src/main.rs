pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod quota_store;
pub mod rate_limit;
pub mod usage;

use anyhow::Context;
use config::{Config, QuotaStoreBackend};
use quota_store::{InMemoryQuotaStore, QuotaStore, ValkeyQuotaStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load().context("加载配置失败")?;

    init_tracing(&cfg);

    let clock: Arc<dyn clock::Clock> = Arc::new(clock::SystemClock);
    let store = connect_store(&cfg, clock.clone()).await?;

    tracing::info!(
        keys = cfg.gemini_api_keys.len(),
        per_minute = cfg.rate_limit_per_minute,
        per_day = cfg.rate_limit_per_day,
        window = cfg.rate_limit_window.as_str(),
        selection = ?cfg.selection_mode,
        "上游 key 池已加载"
    );

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    let state = gateway::build_state(cfg, store, clock).context("初始化网关失败")?;
    let app = gateway::router(state);

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

/// 按配置选择存储后端，并在启动时做一次连通性检查（失败即退出）。
async fn connect_store(
    cfg: &Config,
    clock: Arc<dyn clock::Clock>,
) -> anyhow::Result<Arc<dyn QuotaStore>> {
    let store: Arc<dyn QuotaStore> = match cfg.quota_store {
        QuotaStoreBackend::Valkey => {
            let store = ValkeyQuotaStore::connect(&cfg.valkey_url())
                .await
                .context("连接 Valkey 失败")?;
            tracing::info!(
                host = %cfg.valkey_host,
                port = cfg.valkey_port,
                db = cfg.valkey_db,
                "已连接 Valkey"
            );
            Arc::new(store)
        }
        QuotaStoreBackend::Memory => {
            tracing::warn!("使用进程内配额存储：多个代理进程之间不共享配额");
            Arc::new(InMemoryQuotaStore::new(clock))
        }
    };

    store.ping().await.context("配额存储连通性检查失败")?;
    Ok(store)
}

fn init_tracing(cfg: &Config) {
    // LOG_LEVEL 控制本项目日志级别，依赖库固定在 warn；显式设置的 RUST_LOG 优先。
    let level = cfg.log_level();
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if !env.is_empty() {
        EnvFilter::new(env)
    } else if level == logging::LogLevel::Off {
        EnvFilter::new("off")
    } else {
        EnvFilter::new(format!("warn,gemini_proxy={}", level.directive()))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);

    let _ = if cfg.log_format.trim().eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
