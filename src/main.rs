#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod catalog;
pub mod config;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod storage;
pub mod token;
pub mod upstream;
pub mod usage;
pub mod util;

use anyhow::Context;
use axum::routing::{get, post, put};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    if cfg.api_key.is_empty() {
        tracing::warn!("未配置 API_KEY，所有需要认证的接口都会返回 401");
    }

    let db = storage::Database::open(&cfg.db_path())
        .with_context(|| format!("打开数据库失败: {}", cfg.db_path().display()))?;

    let catalog = Arc::new(
        catalog::ModelCatalog::load(db.clone())
            .await
            .context("加载模型目录失败")?,
    );
    tracing::info!("已加载 {} 个模型", catalog.all_models().len());

    let upstream = upstream::UpstreamClient::new(&cfg).context("初始化上游客户端失败")?;

    // 模型目录：启动后立即刷新一次，之后按周期刷新；间隔为 0 时只保留手动刷新。
    let refresher = catalog::ModelRefresher::new(
        catalog.clone(),
        upstream.clone(),
        cfg.free_model_suffix.clone(),
    );
    if cfg.model_refresh_interval_secs > 0 {
        catalog::spawn_refresh_task(
            refresher.clone(),
            Duration::from_secs(cfg.model_refresh_interval_secs),
        );
    } else {
        tracing::info!("已关闭模型目录自动刷新");
    }

    let pool = credential::CredentialPool::new(db.clone());
    let recorder = usage::UsageRecorder::new(db.clone());

    let api_state = Arc::new(gateway::openai::ApiState {
        cfg: cfg.clone(),
        dispatcher: gateway::openai::RequestDispatcher::new(
            pool,
            catalog.clone(),
            recorder.clone(),
            upstream,
            cfg.log_level(),
        ),
    });

    let manager_state = Arc::new(gateway::manager::ManagerState {
        credentials: credential::CredentialStore::new(db.clone()),
        usage: recorder,
        catalog,
        refresher,
    });

    let auth = gateway::auth::BearerAuth::new(&cfg.api_key);

    // === 公开路由 ===
    let public_routes = Router::new().route("/health", get(handle_health));

    // === API 路由 ===
    let api_routes = Router::new()
        .route("/v1/models", get(gateway::openai::handle_list_models))
        .route(
            "/v1/chat/completions",
            post(gateway::openai::handle_chat_completions),
        )
        // 允许尾随斜杠的同一路径
        .route(
            "/v1/chat/completions/",
            post(gateway::openai::handle_chat_completions),
        )
        .with_state(api_state);

    // === Manager API 路由 ===
    let manager_api_routes = Router::new()
        .route(
            "/manager/api/keys",
            get(gateway::manager::handle_list_keys).post(gateway::manager::handle_add_key),
        )
        .route(
            "/manager/api/keys/{id}",
            put(gateway::manager::handle_update_key).delete(gateway::manager::handle_delete_key),
        )
        .route(
            "/manager/api/keys/{id}/active",
            post(gateway::manager::handle_set_key_active),
        )
        .route("/manager/api/stats", get(gateway::manager::handle_stats))
        .route("/manager/api/logs", get(gateway::manager::handle_logs))
        .route("/manager/api/filters", get(gateway::manager::handle_filters))
        .route("/manager/api/models", get(gateway::manager::handle_models))
        .route(
            "/manager/api/models/refresh",
            post(gateway::manager::handle_refresh_models),
        )
        .with_state(manager_state);

    // === 受保护路由（需要认证）===
    let protected_routes = Router::new()
        .merge(api_routes)
        .merge(manager_api_routes)
        .layer(middleware::from_fn_with_state(
            auth,
            gateway::auth::require_bearer,
        ));

    let app = Router::new().merge(public_routes).merge(protected_routes);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

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

async fn handle_health() -> &'static str {
    "ok"
}

fn init_tracing(cfg: &config::Config) {
    // 依赖库日志默认压到 warn，本项目自身日志至少为 info；DEBUG=off 时只保留告警。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("warn")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,or2api=info")
        } else if env.contains("or2api") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},or2api=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
