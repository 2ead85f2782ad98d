use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use gateway::{
    AppState,
    admission::{
        AdaptiveRateLimiter, AdmissionGate, AuditSink, HttpQuotaAuthority, PgAuditSink,
        QuotaAuthority, TieredRateLimiter, TracingAuditSink, UnlimitedQuota,
    },
    cache::RedisWindowStore,
    config::Config,
    routes,
};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置
    let config = Config::from_env().expect("Failed to load configuration");
    tracing::info!(
        failure_mode = ?config.failure_mode,
        paths = ?config.admission_paths,
        "Admission gate configured"
    );

    // 设置 Redis 客户端，滑动窗口在所有 worker 之间共享
    let redis_client =
        redis::Client::open(config.redis_url.clone()).expect("Failed to create Redis client");
    let store = Arc::new(RedisWindowStore::new(Arc::new(redis_client)));

    // 额度服务
    let quota: Arc<dyn QuotaAuthority> = match config.quota_service_url.as_deref() {
        Some(url) => Arc::new(
            HttpQuotaAuthority::new(url, config.quota_timeout())
                .expect("Failed to create quota client"),
        ),
        None => {
            tracing::warn!("QUOTA_SERVICE_URL not set, quota checks always pass");
            Arc::new(UnlimitedQuota)
        }
    };

    // 审计记录：配置了数据库时写入 Postgres，否则只写日志
    let audit: Arc<dyn AuditSink> = match config.database_url.as_deref() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .expect("Failed to connect to Postgres");
            Arc::new(PgAuditSink::new(pool))
        }
        None => Arc::new(TracingAuditSink),
    };

    let limiter = AdaptiveRateLimiter::new(
        TieredRateLimiter::new(store, config.limit_config()),
        config.adaptive_config(),
    );
    let gate = AdmissionGate::new(limiter, quota, audit, config.gate_settings());

    // 设置应用状态
    let state = AppState {
        config: config.clone(),
        gate: Arc::new(gate),
        http: reqwest::Client::new(),
    };

    let router = routes::create_router(state.clone());

    // 根据编译模式决定是否添加CORS
    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding CORS layer for development mode");
        router.layer(CorsLayer::permissive())
    };

    // 启动服务器
    let addr = SocketAddr::new(
        state.config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        state.config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}
