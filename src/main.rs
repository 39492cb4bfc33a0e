use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use box_office::{
    clock::SystemClock,
    config::{Config, LogFormat},
    redis_client::RedisClient,
    router,
    services::{
        cleanup::CleanupService,
        identity::{HttpIdentityProvider, JwtVerifier},
        notify,
        payment::HttpPaymentGateway,
    },
    store::HttpDataStore,
    tasks::{RedisTaskQueue, TaskQueue, TaskWorker},
    AppState, Services,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.app.rust_log));
    let registry = tracing_subscriber::registry().with(filter);
    match config.app.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("🛑 Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(&config);

    info!(environment = %config.app.environment, "Starting Box Office API");

    // Connect to Redis
    let redis = RedisClient::new(&config.redis.url)
        .await
        .context("failed to connect to Redis")?;
    redis.ping().await.context("Redis did not answer PING")?;
    info!("Redis connected");

    let queue = Arc::new(RedisTaskQueue::new(redis));
    match queue.depths().await {
        Ok(depths) => {
            for (name, len) in depths {
                info!(queue = name.key(), pending = len, "📬 task backlog");
            }
        }
        Err(e) => warn!(error = %e, "failed to read task queue depths"),
    }
    // Задачи, брошенные прошлым запуском посреди обработки
    match queue.recover().await {
        Ok(0) => {}
        Ok(recovered) => info!(recovered, "♻️ requeued tasks left in flight by a previous run"),
        Err(e) => warn!(error = %e, "failed to recover in-flight tasks"),
    }
    let store = Arc::new(HttpDataStore::from_config(&config.store).context("failed to build store client")?);
    let gateway = Arc::new(
        HttpPaymentGateway::from_config(&config.payment, &config.circuit_breaker)
            .context("failed to build payment gateway client")?,
    );
    let identity = Arc::new(
        HttpIdentityProvider::new(&config.store, JwtVerifier::new(&config.jwt))
            .context("failed to build identity client")?,
    );
    let notifier = notify::from_config(&config.notify).context("failed to build notifier")?;

    let state = AppState::new(
        config.clone(),
        Services {
            store,
            gateway,
            distributor: queue.clone(),
            identity,
            notifier,
            clock: Arc::new(SystemClock),
        },
    );

    // --- Start background tasks ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut background = TaskWorker::new(queue, state.processor.clone(), config.worker.clone()).spawn(shutdown_rx.clone());
    info!(concurrency = config.worker.concurrency, "Task workers started");

    background.push(CleanupService::new(state.saga.clone(), config.worker.sweep_interval_seconds).spawn(shutdown_rx));

    // --- Start the web server ---
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port)
        .parse()
        .context("invalid HOST/PORT")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Воркеры дорабатывают текущую задачу и выходят
    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    info!("👋 Shutdown complete");
    Ok(())
}
