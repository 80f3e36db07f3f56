//! NotifyHub Outbox Processor
//!
//! Drains pending outbox rows to the bus and runs the out-of-band recovery
//! reconciler plus the status-outbox drainer.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `NOTIFYHUB_CONFIG` | - | Path to notifyhub.toml |
//! | `NOTIFYHUB_STORE_KIND` | `mongodb` | Store backend: `sqlite` or `mongodb` |
//! | `NOTIFYHUB_BUS_KIND` | `sqlite` | Bus backend: `sqlite` or `sqs` |
//! | `NH_METRICS_PORT` | `9091` | Metrics/health port |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use nh_bus::BusPublisher;
use nh_config::{AppConfig, ConfigLoader};
use nh_coord::{
    CoordHealth, IdempotencyStore, MemoryCoord, MemoryCoordConfig, RateLimits, RedisCoord,
    RedisCoordConfig,
};
use nh_outbox::{OutboxDispatcher, OutboxDispatcherConfig};
use nh_recovery::{DrainerConfig, Reconciler, ReconcilerConfig, StatusOutboxDrainer};
use nh_store::{AlertStore, NotificationStore, OutboxStore, StatusOutboxStore};

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

struct Stores {
    notifications: Arc<dyn NotificationStore>,
    outbox: Arc<dyn OutboxStore>,
    status_outbox: Arc<dyn StatusOutboxStore>,
    alerts: Arc<dyn AlertStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    nh_common::logging::init_logging("nh-outbox-processor");

    info!("Starting NotifyHub Outbox Processor");

    let config = ConfigLoader::new().load()?;
    let metrics_port: u16 = env_or_parse("NH_METRICS_PORT", 9091);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let stores = create_stores(&config).await?;
    let bus_publisher = create_bus_publisher(&config).await?;
    let (idempotency, coord_health) = create_coord(&config).await?;

    // Outbox dispatcher + retention cleanup
    let dispatcher = Arc::new(OutboxDispatcher::new(
        stores.outbox.clone(),
        bus_publisher.clone(),
        OutboxDispatcherConfig {
            poll_interval: Duration::from_millis(config.outbox.poll_interval_ms),
            batch_size: config.outbox.batch_size,
            claim_timeout_ms: config.outbox.claim_timeout_ms,
            cleanup_interval: Duration::from_millis(config.outbox.cleanup_interval_ms),
            retention: Duration::from_millis(config.outbox.retention_ms),
            worker_id: config.worker_id.clone(),
        },
    ));

    let dispatcher_handle = {
        let dispatcher = dispatcher.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = dispatcher.run() => {}
                _ = shutdown_rx.recv() => {
                    info!("Outbox dispatcher shutting down; claims expire by lease");
                }
            }
        })
    };

    let cleanup_handle = {
        let dispatcher = dispatcher.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = dispatcher.run_cleanup() => {}
                _ = shutdown_rx.recv() => {}
            }
        })
    };

    // Recovery reconciler
    let reconciler = Reconciler::new(
        stores.notifications.clone(),
        stores.alerts.clone(),
        idempotency,
        coord_health,
        ReconcilerConfig {
            interval: Duration::from_millis(config.recovery.interval_ms),
            batch_size: config.recovery.batch_size,
            processing_ttl: Duration::from_secs(config.delivery.processing_ttl_seconds),
            orphan_threshold: Duration::from_millis(config.recovery.orphan_threshold_ms),
            orphan_alert_threshold: config.recovery.orphan_alert_threshold,
            orphan_critical_threshold: config.recovery.orphan_critical_threshold,
        },
    );

    let reconciler_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = reconciler.run() => {}
                _ = shutdown_rx.recv() => {
                    info!("Reconciler shutting down");
                }
            }
        })
    };

    // Status-outbox drainer (publishes healed statuses)
    let drainer = StatusOutboxDrainer::new(
        stores.status_outbox.clone(),
        stores.notifications.clone(),
        bus_publisher,
        DrainerConfig {
            claim_timeout_ms: config.outbox.claim_timeout_ms,
            worker_id: config.worker_id.clone(),
            ..Default::default()
        },
    );

    let drainer_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = drainer.run() => {}
                _ = shutdown_rx.recv() => {}
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

    info!("NotifyHub Outbox Processor started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = dispatcher_handle.await;
        let _ = cleanup_handle.await;
        let _ = reconciler_handle.await;
        let _ = drainer_handle.await;
        let _ = metrics_handle.await;
    })
    .await;

    info!("NotifyHub Outbox Processor shutdown complete");
    Ok(())
}

async fn create_stores(config: &AppConfig) -> Result<Stores> {
    match config.store.kind.as_str() {
        "sqlite" => {
            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&config.store.uri)
                .await?;
            let store = Arc::new(nh_store::sqlite::SqliteStore::new(pool));
            store.init_schema().await?;
            info!("Using SQLite store: {}", config.store.uri);
            Ok(Stores {
                notifications: store.clone(),
                outbox: store.clone(),
                status_outbox: store.clone(),
                alerts: store,
            })
        }
        "mongodb" => {
            let client = mongodb::Client::with_uri_str(&config.store.uri).await?;
            let store = Arc::new(nh_store::mongo::MongoStore::new(
                client,
                &config.store.database,
            ));
            store.init_schema().await?;
            info!("Using MongoDB store: {}", config.store.database);
            Ok(Stores {
                notifications: store.clone(),
                outbox: store.clone(),
                status_outbox: store.clone(),
                alerts: store,
            })
        }
        other => Err(anyhow::anyhow!(
            "Unknown store kind: {}. Use sqlite or mongodb",
            other
        )),
    }
}

async fn create_bus_publisher(config: &AppConfig) -> Result<Arc<dyn BusPublisher>> {
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
            Ok(Arc::new(bus))
        }
        "sqs" => {
            let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let client = aws_sdk_sqs::Client::new(&aws_config);
            info!("Using SQS bus: {}", config.bus.sqs_queue_url_prefix);
            Ok(Arc::new(nh_bus::sqs::SqsBusPublisher::new(
                client,
                config.bus.sqs_queue_url_prefix.clone(),
            )))
        }
        other => Err(anyhow::anyhow!("Unknown bus kind: {}. Use sqlite or sqs", other)),
    }
}

async fn create_coord(
    config: &AppConfig,
) -> Result<(Arc<dyn IdempotencyStore>, Arc<dyn CoordHealth>)> {
    // The reconciler only reads idempotency records; rate limits are unused
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
            Ok((Arc::new(coord.clone()), Arc::new(coord)))
        }
        "memory" => {
            warn!("Using in-process coordination store; single-process mode only");
            let coord = MemoryCoord::new(
                MemoryCoordConfig {
                    processing_ttl_ms: config.delivery.processing_ttl_seconds * 1000,
                    idempotency_ttl_ms: config.delivery.idempotency_ttl_seconds * 1000,
                    claim_ttl_ms: config.scheduled.claim_timeout_ms,
                    worker_id: config.worker_id.clone(),
                },
                limits,
            );
            Ok((Arc::new(coord.clone()), Arc::new(coord)))
        }
        other => Err(anyhow::anyhow!(
            "Unknown coordination kind: {}. Use redis or memory",
            other
        )),
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
