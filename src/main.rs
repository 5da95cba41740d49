use anyhow::Context;
use axum::Router;
use axum::routing::{delete, get, post};
use ds2api::auth::{LoginFn, Resolver};
use ds2api::deepseek::{DeepSeekClient, PowSolver};
use ds2api::gateway::GatewayState;
use ds2api::gateway::openai::store::ResponseStore;
use ds2api::{account, admin, config, gateway};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store = Arc::new(config::Store::load().context("加载配置失败")?);
    init_tracing(&store);

    let state = build_state(store).context("初始化网关状态失败")?;
    let app = build_router(state.clone());

    let env = state.store.env();
    let addr: SocketAddr = format!("{}:{}", env.host, env.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], env.port)));

    tracing::info!("ds2api listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

/// 组装全局状态：配置存储 → 账号池 → 解析器 → 上游客户端。
fn build_state(store: Arc<config::Store>) -> anyhow::Result<Arc<GatewayState>> {
    let pool = Arc::new(account::Pool::new(&store));

    let pow_pool_size = PowSolver::pool_size_from_env(store.env().pow_pool_size);
    let client = DeepSeekClient::new(pow_pool_size, store.env().log_level())
        .context("初始化 DeepSeek 客户端失败")?;

    let login_client = client.clone();
    let login: LoginFn = Arc::new(move |acc| {
        let client = login_client.clone();
        Box::pin(async move {
            client
                .login(&CancellationToken::new(), &acc)
                .await
                .map_err(anyhow::Error::new)
        })
    });
    let resolver = Arc::new(Resolver::new(store.clone(), pool.clone(), login));

    let responses = Arc::new(ResponseStore::new(Duration::from_secs(
        store.responses_store_ttl_seconds(),
    )));

    Ok(Arc::new(GatewayState {
        store,
        pool,
        auth: resolver,
        client,
        responses,
    }))
}

fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/v1/chat/completions",
            post(gateway::openai::handler::handle_chat_completions),
        )
        .route(
            "/v1/responses",
            post(gateway::openai::responses::handle_responses),
        )
        .route(
            "/v1/responses/{id}",
            get(gateway::openai::responses::handle_get_response),
        )
        .route(
            "/v1/embeddings",
            post(gateway::openai::handler::handle_embeddings),
        )
        .route("/v1/messages", post(gateway::claude::handler::handle_messages))
        .route("/v1/models", get(gateway::openai::handler::handle_list_models))
        .route(
            "/v1/models/{id}",
            get(gateway::openai::handler::handle_get_model),
        )
        .route("/admin/login", post(admin::handler::handle_login))
        .route(
            "/admin/accounts",
            get(admin::handler::handle_list_accounts).post(admin::handler::handle_add_account),
        )
        .route(
            "/admin/accounts/{identifier}",
            delete(admin::handler::handle_delete_account),
        )
        .route("/admin/pool", get(admin::handler::handle_pool_status))
        .route(
            "/admin/settings",
            get(admin::handler::handle_get_settings).put(admin::handler::handle_put_settings),
        )
        .with_state(state)
}

fn init_tracing(store: &config::Store) {
    let debug = store.env().debug.trim().to_lowercase();
    let filter = if debug == "off" && std::env::var("RUST_LOG").is_err() {
        EnvFilter::new("warn,ds2api=info")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,ds2api=info")
        } else if env.contains("ds2api") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},ds2api=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn handle_health() -> &'static str {
    "ok"
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
