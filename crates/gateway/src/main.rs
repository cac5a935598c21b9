//! Gateway service entry point.
//!
//! Realtime resource gateway serving WebSocket and HTTP clients.

use anyhow::{bail, Result};
use gateway::{create_router, AppState, Cache, CacheConfig, Config, ConnRegistry};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::{MessageBus, NatsClient, NatsConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = Config::from_env()?;
    config.validate()?;

    info!("Configuration:");
    info!("  NATS_URL: {}", config.nats_url);
    info!("  REQUEST_TIMEOUT_MS: {}", config.request_timeout.as_millis());
    info!("  ADDR: {}", config.addr);
    info!("  PORT: {}", config.port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  WS_PATH: {}", config.ws_path);
    info!("  API_PATH: {}", config.api_path);
    info!("  API_ENCODING: {}", config.api_encoding);
    info!("  HEADER_AUTH: {}", config.header_auth.as_deref().unwrap_or("-"));
    info!("  PUT_METHOD: {}", config.put_method.as_deref().unwrap_or("-"));
    info!("  DELETE_METHOD: {}", config.delete_method.as_deref().unwrap_or("-"));
    info!("  PATCH_METHOD: {}", config.patch_method.as_deref().unwrap_or("-"));
    info!("  RESET_THROTTLE: {}", config.reset_throttle);
    info!("  REFERENCE_THROTTLE: {}", config.reference_throttle);
    info!("  CACHE_WORKERS: {}", config.cache_workers);
    info!("  UNSUBSCRIBE_DELAY_MS: {}", config.unsubscribe_delay.as_millis());

    // Start Prometheus metrics server
    if config.metrics_port > 0 {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.metrics_port))
            .install()?;
        info!("Prometheus metrics server started on port {}", config.metrics_port);
    }

    // Connect to NATS
    info!("Connecting to NATS at {}", config.nats_url);
    let nats_client = NatsClient::connect(NatsConfig {
        url: config.nats_url.clone(),
        request_timeout: config.request_timeout,
    })
    .await?;
    let bus: Arc<dyn MessageBus> = Arc::new(nats_client);
    info!("Connected to NATS");

    // Stop serving if the bus connection is lost
    let bus_closed = Arc::new(Notify::new());
    let bus_lost = Arc::new(AtomicBool::new(false));
    {
        let bus_closed = bus_closed.clone();
        let bus_lost = bus_lost.clone();
        bus.set_closed_handler(Box::new(move |reason| {
            error!("NATS connection closed: {}", reason.as_deref().unwrap_or("unknown reason"));
            bus_lost.store(true, Ordering::Release);
            bus_closed.notify_one();
        }));
    }

    // Create resource cache
    let cache = Cache::new(
        bus.clone(),
        CacheConfig {
            workers: config.cache_workers,
            reset_throttle: config.reset_throttle,
            unsubscribe_delay: config.unsubscribe_delay,
        },
    );
    cache.start()?;

    // Create connection registry
    let registry = Arc::new(ConnRegistry::new());
    {
        let registry = registry.clone();
        cache.set_token_reset_handler(move |tids, subject| registry.token_reset(tids, subject));
    }

    // Create HTTP router
    let state = Arc::new(AppState::new(&config, cache.clone(), registry.clone()));
    let app = create_router(state);

    // Start HTTP server
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway listening on {}", addr);

    // Close client connections as soon as shutdown starts
    let shutdown = {
        let registry = registry.clone();
        async move {
            shutdown_signal(bus_closed).await;
            info!("Shutting down...");
            registry.stop();
        }
    };

    // Run server with graceful shutdown
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;

    cache.stop();
    bus.close();

    if bus_lost.load(Ordering::Acquire) {
        bail!("NATS connection lost");
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal(bus_closed: Arc<Notify>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
        _ = bus_closed.notified() => info!("Bus connection closed"),
    }
}
