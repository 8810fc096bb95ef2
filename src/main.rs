use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use scooter_fleet::{
    AppState, app,
    cache::{FleetCache, RedisCache},
    config::Config,
    propagator::ChangePropagator,
    reservation::Reconciler,
    store::{FleetStore, PgFleetStore, feed::PgChangeFeed},
};
use sqlx::Executor;
use sqlx::postgres::PgPoolOptions;
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

    #[cfg(debug_assertions)]
    tracing::info!("Running in debug mode with CORS enabled");

    #[cfg(not(debug_assertions))]
    tracing::info!("Running in production mode with CORS disabled");

    // 设置数据库连接池
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(config.store_timeout())
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET application_name = 'scooter_fleet';").await?;
                Ok(())
            })
        })
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to Postgres");

    let pg_store = PgFleetStore::new(pool.clone(), &config.fleet_table, &config.trip_table);
    pg_store
        .ensure_schema(&config.change_channel)
        .await
        .expect("Failed to apply schema");
    let store: Arc<dyn FleetStore> = Arc::new(pg_store);

    // 设置 Redis 客户端
    let redis_client =
        redis::Client::open(config.redis_url.clone()).expect("Failed to create Redis client");
    let cache: Arc<dyn FleetCache> = Arc::new(RedisCache::new(Arc::new(redis_client)));

    let (state, pending_releases) = AppState::new(config.clone(), store.clone(), cache.clone());

    // 变更传播：监听表触发器发出的通知
    let feed = PgChangeFeed::connect(&pool, &config.change_channel)
        .await
        .expect("Failed to listen for fleet changes");
    let propagator = ChangePropagator::new(store.clone(), cache, &config);
    tokio::spawn(async move { propagator.run(feed).await });

    // 对账：释放队列与定期扫描
    let reconciler = Reconciler::new(store, pending_releases, &config);
    tokio::spawn(reconciler.run());

    // 启动服务器
    let addr = SocketAddr::new(
        config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        app(state),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Failed to start server");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
