//! NotifyHub Scheduler Server
//!
//! Runs the scheduled consumer (delayed topic -> scheduled queue) and the
//! due-entry poller (scheduled queue -> channel topics).
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `NOTIFYHUB_CONFIG` | - | Path to notifyhub.toml |
//! | `NOTIFYHUB_COORD_URL` | `redis://localhost:6379` | Coordination store URL |
//! | `NH_METRICS_PORT` | `9092` | Metrics/health port |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use nh_bus::{BusConsumer, BusPublisher};
use nh_config::{AppConfig, ConfigLoader};
use nh_coord::{
    MemoryCoord, MemoryCoordConfig, RateLimits, RedisCoord, RedisCoordConfig, ScheduledQueue,
};
use nh_scheduler::{DuePoller, DuePollerConfig, ScheduledConsumer};

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    nh_common::logging::init_logging("nh-scheduler-server");

    info!("Starting NotifyHub Scheduler");

    let config = ConfigLoader::new().load()?;
    let metrics_port: u16 = env_or_parse("NH_METRICS_PORT", 9092);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let queue = create_scheduled_queue(&config).await?;
    let (publisher, delayed_consumer) = create_bus(&config).await?;

    // Scheduled consumer: delayed topic -> queue
    let consumer = ScheduledConsumer::new(delayed_consumer, queue.clone());
    let consumer_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = consumer.run() => {}
                _ = shutdown_rx.recv() => {
                    info!("Scheduled consumer shutting down");
                }
            }
        })
    };

    // Poller: queue -> channel topics
    let poller = DuePoller::new(
        queue,
        publisher,
        DuePollerConfig {
            poll_interval: Duration::from_millis(config.scheduled.poll_interval_ms),
            batch_size: config.scheduled.batch_size,
            max_poller_retries: config.scheduled.max_poller_retries,
            ..Default::default()
        },
    );
    let poller_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = poller.run() => {}
                _ = shutdown_rx.recv() => {
                    info!("Scheduled poller shutting down; claims expire by TTL");
                }
            }
        })
    };

    // Metrics/health endpoint
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    info!("Metrics server listening on http://{}/metrics", metrics_addr);

    let metrics_app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || {
                let prometheus = prometheus.clone();
                async move { prometheus.render() }
            }),
        )
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler));

    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    let metrics_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("NotifyHub Scheduler started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = consumer_handle.await;
        let _ = poller_handle.await;
        let _ = metrics_handle.await;
    })
    .await;

    info!("NotifyHub Scheduler shutdown complete");
    Ok(())
}

async fn create_scheduled_queue(config: &AppConfig) -> Result<Arc<dyn ScheduledQueue>> {
    let limits = RateLimits::new(
        nh_config::ChannelConfig::DEFAULT_MAX_TOKENS,
        nh_config::ChannelConfig::DEFAULT_REFILL_RATE,
    );

    match config.coord.kind.as_str() {
        "redis" => {
            let coord = RedisCoord::connect(
                RedisCoordConfig {
                    url: config.coord.url.clone(),
                    processing_ttl_ms: config.delivery.processing_ttl_seconds * 1000,
                    idempotency_ttl_ms: config.delivery.idempotency_ttl_seconds * 1000,
                    claim_ttl_ms: config.scheduled.claim_timeout_ms,
                    worker_id: config.worker_id.clone(),
                },
                limits,
            )
            .await?;
            info!("Using Redis coordination store: {}", config.coord.url);
            Ok(Arc::new(coord))
        }
        "memory" => {
            warn!("Using in-process scheduled queue; single-process mode only");
            Ok(Arc::new(MemoryCoord::new(
                MemoryCoordConfig {
                    processing_ttl_ms: config.delivery.processing_ttl_seconds * 1000,
                    idempotency_ttl_ms: config.delivery.idempotency_ttl_seconds * 1000,
                    claim_ttl_ms: config.scheduled.claim_timeout_ms,
                    worker_id: config.worker_id.clone(),
                },
                limits,
            )))
        }
        other => Err(anyhow::anyhow!(
            "Unknown coordination kind: {}. Use redis or memory",
            other
        )),
    }
}

async fn create_bus(
    config: &AppConfig,
) -> Result<(Arc<dyn BusPublisher>, Arc<dyn BusConsumer>)> {
    match config.bus.kind.as_str() {
        "sqlite" => {
            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&config.bus.sqlite_path)
                .await?;
            let bus = nh_bus::sqlite::SqliteBus::new(pool, config.bus.visibility_timeout_seconds);
            use nh_bus::EmbeddedBus;
            bus.init_schema().await?;
            info!("Using SQLite bus: {}", config.bus.sqlite_path);
            let consumer = bus.consumer(nh_common::DELAYED_TOPIC);
            Ok((Arc::new(bus), Arc::new(consumer)))
        }
        "sqs" => {
            let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let client = aws_sdk_sqs::Client::new(&aws_config);
            info!("Using SQS bus: {}", config.bus.sqs_queue_url_prefix);
            let publisher = nh_bus::sqs::SqsBusPublisher::new(
                client.clone(),
                config.bus.sqs_queue_url_prefix.clone(),
            );
            let consumer = nh_bus::sqs::SqsTopicConsumer::new(
                client,
                &config.bus.sqs_queue_url_prefix,
                nh_common::DELAYED_TOPIC,
                config.bus.visibility_timeout_seconds as i32,
            )
            .with_wait_time_seconds(config.bus.wait_time_seconds as i32);
            Ok((Arc::new(publisher), Arc::new(consumer)))
        }
        other => Err(anyhow::anyhow!("Unknown bus kind: {}. Use sqlite or sqs", other)),
    }
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "READY"
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
