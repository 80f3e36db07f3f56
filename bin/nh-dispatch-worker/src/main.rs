//! NotifyHub Dispatch Worker
//!
//! Runs one dispatch consumer per configured channel plus the status sink.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `NOTIFYHUB_CONFIG` | - | Path to notifyhub.toml |
//! | `NOTIFYHUB_CHANNELS` | from config | Comma-separated channels to consume |
//! | `NOTIFYHUB_PLUGIN_CONFIG` | `plugins.toml` | Provider plugin config file |
//! | `NH_METRICS_PORT` | `9090` | Metrics/health port |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use nh_bus::{BusConsumer, BusPublisher};
use nh_config::{AppConfig, ConfigLoader, PluginConfig};
use nh_coord::{
    IdempotencyStore, MemoryCoord, MemoryCoordConfig, RateLimiter, RateLimits, RedisCoord,
    RedisCoordConfig,
};
use nh_dispatch::{ChannelConsumer, ChannelConsumerConfig};
use nh_plugin::{providers::build_provider, ProviderRegistry};
use nh_status::{StatusSink, WebhookClient, WebhookClientConfig};
use nh_store::NotificationStore;

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    nh_common::logging::init_logging("nh-dispatch-worker");

    info!("Starting NotifyHub Dispatch Worker");

    let config = ConfigLoader::new().load()?;
    let metrics_port: u16 = env_or_parse("NH_METRICS_PORT", 9090);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Composition: store, bus, providers, coordination
    let notifications = create_notification_store(&config).await?;
    let bus_publisher = create_bus_publisher(&config).await?;
    let (registry, limits) = create_registry(&config)?;
    let (idempotency, rate_limiter) = create_coord(&config, limits).await?;

    info!(
        channels = ?config.channels,
        providers = registry.len(),
        "Dispatch worker composed"
    );

    // One consumer task per channel
    let mut task_handles = Vec::new();
    for channel in &config.channels {
        let consumer = create_topic_consumer(&config, &nh_common::channel_topic(channel)).await?;
        let channel_consumer = ChannelConsumer::new(
            ChannelConsumerConfig {
                channel: channel.clone(),
                max_retry_count: config.delivery.max_retry_count,
                base_delay_ms: config.delivery.base_delay_ms,
                poll_batch: 10,
                idle_delay: Duration::from_millis(200),
            },
            consumer,
            bus_publisher.clone(),
            registry.clone(),
            idempotency.clone(),
            rate_limiter.clone(),
        );

        let mut shutdown_rx = shutdown_tx.subscribe();
        task_handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = channel_consumer.run() => {}
                _ = shutdown_rx.recv() => {
                    info!("Dispatch consumer shutting down");
                }
            }
        }));
    }

    // Status sink
    let status_consumer = create_topic_consumer(&config, nh_common::STATUS_TOPIC).await?;
    let sink = StatusSink::new(
        status_consumer,
        notifications,
        WebhookClient::new(WebhookClientConfig {
            timeout: Duration::from_millis(config.webhook.timeout_ms),
            signing_secret: config.webhook.signing_secret.clone(),
        }),
    );
    {
        let mut shutdown_rx = shutdown_tx.subscribe();
        task_handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = sink.run() => {}
                _ = shutdown_rx.recv() => {
                    info!("Status sink shutting down");
                }
            }
        }));
    }

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

    info!("NotifyHub Dispatch Worker started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        for handle in task_handles {
            let _ = handle.await;
        }
        let _ = metrics_handle.await;
    })
    .await;

    info!("NotifyHub Dispatch Worker shutdown complete");
    Ok(())
}

async fn create_notification_store(config: &AppConfig) -> Result<Arc<dyn NotificationStore>> {
    match config.store.kind.as_str() {
        "sqlite" => {
            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&config.store.uri)
                .await?;
            let store = nh_store::sqlite::SqliteStore::new(pool);
            store.init_schema().await?;
            info!("Using SQLite store: {}", config.store.uri);
            Ok(Arc::new(store))
        }
        "mongodb" => {
            let client = mongodb::Client::with_uri_str(&config.store.uri).await?;
            let store = nh_store::mongo::MongoStore::new(client, &config.store.database);
            store.init_schema().await?;
            info!("Using MongoDB store: {}", config.store.database);
            Ok(Arc::new(store))
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

async fn create_topic_consumer(config: &AppConfig, topic: &str) -> Result<Arc<dyn BusConsumer>> {
    match config.bus.kind.as_str() {
        "sqlite" => {
            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&config.bus.sqlite_path)
                .await?;
            let bus = nh_bus::sqlite::SqliteBus::new(pool, config.bus.visibility_timeout_seconds);
            Ok(Arc::new(bus.consumer(topic)))
        }
        "sqs" => {
            let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let client = aws_sdk_sqs::Client::new(&aws_config);
            Ok(Arc::new(
                nh_bus::sqs::SqsTopicConsumer::new(
                    client,
                    &config.bus.sqs_queue_url_prefix,
                    topic,
                    config.bus.visibility_timeout_seconds as i32,
                )
                .with_wait_time_seconds(config.bus.wait_time_seconds as i32),
            ))
        }
        other => Err(anyhow::anyhow!("Unknown bus kind: {}. Use sqlite or sqs", other)),
    }
}

async fn create_coord(
    config: &AppConfig,
    limits: RateLimits,
) -> Result<(Arc<dyn IdempotencyStore>, Arc<dyn RateLimiter>)> {
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

fn create_registry(config: &AppConfig) -> Result<(Arc<ProviderRegistry>, RateLimits)> {
    let registry = Arc::new(ProviderRegistry::new());
    let mut limits = RateLimits::new(
        nh_config::ChannelConfig::DEFAULT_MAX_TOKENS,
        nh_config::ChannelConfig::DEFAULT_REFILL_RATE,
    );

    let plugin_path = std::path::Path::new(&config.plugin_config_path);
    if plugin_path.exists() {
        let plugin_config = PluginConfig::from_file(plugin_path)?;
        for entry in &plugin_config.providers {
            let provider = build_provider(entry, Duration::from_secs(30))?;
            // A plugin-level rate limit seeds the channel bucket; explicit
            // channel config below still wins
            if let Some(rate_limit) = &entry.options.rate_limit {
                limits.set(
                    provider.manifest().channel,
                    rate_limit.max_tokens,
                    rate_limit.refill_rate,
                );
            }
            registry.register(provider, entry.options.priority)?;
        }
        info!(
            path = %config.plugin_config_path,
            providers = registry.len(),
            "Providers loaded from plugin config"
        );
    } else {
        warn!(
            path = %config.plugin_config_path,
            "Plugin config not found; no providers registered"
        );
    }

    for (channel, channel_config) in &config.channel {
        limits.set(channel, channel_config.max_tokens, channel_config.refill_rate);
        registry.set_channel_defaults(
            channel,
            channel_config.default_provider.clone(),
            channel_config.fallback_provider.clone(),
        );
    }

    Ok((registry, limits))
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
