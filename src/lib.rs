pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod http;
pub mod ingest;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod state;

use axum::{Router, http::StatusCode, middleware as axum_middleware};
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

use config::Config;
use db::PgAggregateStore;
use engine::RatingService;
use errors::AppError;
use ingest::{RatingConsumer, RedisStreamQueue};
use middleware::{cors_layer, create_rate_limiter, rate_limit_middleware};
use state::AppState;

pub fn init_tracing(config: &Config) {
    let default_level = if config.is_local() { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.is_local() {
        builder.try_init()
    } else {
        builder.json().try_init()
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already set: {e}");
    }
}

/// The HTTP application with every production layer applied.
pub fn create_app(state: AppState, config: &Config) -> Router {
    let rate_limiter = create_rate_limiter(config.rate_limit_per_minute);

    Router::new()
        .merge(http::create_http_routes(state))
        .layer(axum_middleware::from_fn(move |req, next| {
            rate_limit_middleware(rate_limiter.clone(), req, next)
        }))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&config.allowed_origins))
                .layer(TimeoutLayer::new(config.request_timeout())),
        )
        .fallback(|| async { (StatusCode::NOT_FOUND, "404 Not Found") })
}

pub async fn start_server() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    init_tracing(&config);
    observability::init().inspect_err(|e| tracing::error!("Failed to start metrics: {}", e))?;

    let store = PgAggregateStore::connect(&config.database_url, config.pg_pool_max)
        .await
        .inspect_err(|e| tracing::error!("Failed to open database: {}", e))?;
    store
        .migrate()
        .await
        .inspect_err(|e| tracing::error!("Failed to migrate database: {}", e))?;

    let service = Arc::new(
        RatingService::new(Arc::new(store.clone()))
            .with_max_page_size(config.top_games_max_limit)
            .with_store_timeout(config.store_timeout()),
    );

    let manager = RedisConnectionManager::new(config.redis_url.as_str())
        .map_err(AppError::RedisCommandError)?;
    let redis_pool = Pool::builder()
        .build(manager)
        .await
        .map_err(AppError::RedisCommandError)?;

    let queue = RedisStreamQueue::new(
        redis_pool,
        config.ratings_stream.clone(),
        config.ratings_group.clone(),
        config.ratings_consumer.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let consumer = RatingConsumer::new(
        Arc::new(queue),
        service.clone(),
        config.consumer_settings(),
    );
    let consumer_task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    let state = AppState {
        aggregation: service.clone(),
        queries: service,
        max_page_size: config.top_games_max_limit,
    };
    let app = create_app(state, &config);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .map_err(|e| AppError::InternalError(format!("Failed to bind address: {e}")))?;
    tracing::info!("Rating service listening on port {}", config.port);

    let signal_tx = shutdown_tx.clone();
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(true);
    })
    .await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = consumer_task.await {
        tracing::error!("Rating consumer task failed: {}", e);
    }
    store.close().await;

    served.map_err(|e| AppError::InternalError(format!("HTTP server failed: {e}")))?;
    tracing::info!("Rating service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
