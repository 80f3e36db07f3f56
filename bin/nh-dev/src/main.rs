//! NotifyHub Development Monolith
//!
//! All-in-one binary for local development containing:
//! - Ingest demo feeder (optional)
//! - Outbox dispatcher (embedded SQLite store)
//! - Dispatch consumers (embedded SQLite bus)
//! - Scheduled consumer + poller (in-process queue)
//! - Status sink with webhook delivery
//! - Recovery reconciler + status-outbox drainer
//! - Metrics endpoint

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use nh_bus::sqlite::SqliteBus;
use nh_bus::EmbeddedBus;
use nh_common::{channel_topic, DELAYED_TOPIC, STATUS_TOPIC};
use nh_config::PluginConfig;
use nh_coord::{MemoryCoord, MemoryCoordConfig, RateLimits};
use nh_dispatch::{ChannelConsumer, ChannelConsumerConfig};
use nh_ingest::{IngestService, IngestServiceConfig, NotificationRequest};
use nh_outbox::{OutboxDispatcher, OutboxDispatcherConfig};
use nh_plugin::{providers::build_provider, ProviderRegistry};
use nh_recovery::{DrainerConfig, Reconciler, ReconcilerConfig, StatusOutboxDrainer};
use nh_scheduler::{DuePoller, DuePollerConfig, ScheduledConsumer};
use nh_status::{StatusSink, WebhookClient, WebhookClientConfig};
use nh_store::sqlite::SqliteStore;

use sqlx::sqlite::SqlitePoolOptions;

/// NotifyHub Development Server
#[derive(Parser, Debug)]
#[command(name = "nh-dev")]
#[command(about = "NotifyHub Development Monolith - the whole pipeline in one binary")]
struct Args {
    /// SQLite database path shared by store and bus
    #[arg(long, env = "NH_DEV_DB", default_value = "./data/notifyhub-dev.db")]
    db_path: String,

    /// Channels to consume
    #[arg(long, env = "NH_DEV_CHANNELS", default_value = "email,whatsapp")]
    channels: String,

    /// Provider plugin config file
    #[arg(long, env = "NOTIFYHUB_PLUGIN_CONFIG", default_value = "plugins.toml")]
    plugin_config: String,

    /// Metrics server port
    #[arg(long, env = "NH_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Submit one demo email notification at startup to this webhook URL
    #[arg(long, env = "NH_DEV_DEMO_WEBHOOK")]
    demo_webhook: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    nh_common::logging::init_logging("nh-dev");

    let args = Args::parse();
    info!("Starting NotifyHub Development Monolith");

    if let Some(parent) = std::path::Path::new(&args.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut task_handles = Vec::new();

    // Embedded store + bus share one SQLite file
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&format!("sqlite://{}?mode=rwc", args.db_path))
        .await?;

    let store = Arc::new(SqliteStore::new(pool.clone()));
    store.init_schema().await?;
    let bus = SqliteBus::new(pool, 30);
    bus.init_schema().await?;
    info!(db = %args.db_path, "Embedded SQLite store and bus ready");

    // In-process coordination
    let mut limits = RateLimits::new(
        nh_config::ChannelConfig::DEFAULT_MAX_TOKENS,
        nh_config::ChannelConfig::DEFAULT_REFILL_RATE,
    );

    // Providers
    let registry = Arc::new(ProviderRegistry::new());
    let plugin_path = std::path::Path::new(&args.plugin_config);
    if plugin_path.exists() {
        let plugin_config = PluginConfig::from_file(plugin_path)?;
        for entry in &plugin_config.providers {
            let provider = build_provider(entry, Duration::from_secs(30))?;
            if let Some(rate_limit) = &entry.options.rate_limit {
                limits.set(
                    provider.manifest().channel,
                    rate_limit.max_tokens,
                    rate_limit.refill_rate,
                );
            }
            registry.register(provider, entry.options.priority)?;
        }
        info!(providers = registry.len(), "Providers loaded");
    } else {
        warn!(
            path = %args.plugin_config,
            "No plugin config; sends will fail terminally with NO_PROVIDER"
        );
    }

    let coord = MemoryCoord::new(
        MemoryCoordConfig {
            worker_id: "nh-dev".to_string(),
            ..Default::default()
        },
        limits,
    );

    // Outbox dispatcher + cleanup
    let dispatcher = Arc::new(OutboxDispatcher::new(
        store.clone(),
        Arc::new(bus.clone()),
        OutboxDispatcherConfig {
            poll_interval: Duration::from_millis(500),
            worker_id: "nh-dev".to_string(),
            ..Default::default()
        },
    ));
    {
        let dispatcher = dispatcher.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        task_handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = dispatcher.run() => {}
                _ = shutdown_rx.recv() => {}
            }
        }));
    }
    {
        let dispatcher = dispatcher.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        task_handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = dispatcher.run_cleanup() => {}
                _ = shutdown_rx.recv() => {}
            }
        }));
    }

    // Dispatch consumers
    for channel in args.channels.split(',').map(str::trim) {
        let consumer = ChannelConsumer::new(
            ChannelConsumerConfig::new(channel),
            Arc::new(bus.consumer(channel_topic(channel))),
            Arc::new(bus.clone()),
            registry.clone(),
            Arc::new(coord.clone()),
            Arc::new(coord.clone()),
        );
        let mut shutdown_rx = shutdown_tx.subscribe();
        task_handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = consumer.run() => {}
                _ = shutdown_rx.recv() => {}
            }
        }));
    }

    // Scheduler pair
    let scheduled_consumer = ScheduledConsumer::new(
        Arc::new(bus.consumer(DELAYED_TOPIC)),
        Arc::new(coord.clone()),
    );
    {
        let mut shutdown_rx = shutdown_tx.subscribe();
        task_handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = scheduled_consumer.run() => {}
                _ = shutdown_rx.recv() => {}
            }
        }));
    }
    let poller = DuePoller::new(
        Arc::new(coord.clone()),
        Arc::new(bus.clone()),
        DuePollerConfig {
            poll_interval: Duration::from_millis(500),
            ..Default::default()
        },
    );
    {
        let mut shutdown_rx = shutdown_tx.subscribe();
        task_handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = poller.run() => {}
                _ = shutdown_rx.recv() => {}
            }
        }));
    }

    // Status sink
    let sink = StatusSink::new(
        Arc::new(bus.consumer(STATUS_TOPIC)),
        store.clone(),
        WebhookClient::new(WebhookClientConfig::default()),
    );
    {
        let mut shutdown_rx = shutdown_tx.subscribe();
        task_handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = sink.run() => {}
                _ = shutdown_rx.recv() => {}
            }
        }));
    }

    // Recovery reconciler + drainer
    let reconciler = Reconciler::new(
        store.clone(),
        store.clone(),
        Arc::new(coord.clone()),
        Arc::new(coord.clone()),
        ReconcilerConfig {
            interval: Duration::from_secs(15),
            ..Default::default()
        },
    );
    {
        let mut shutdown_rx = shutdown_tx.subscribe();
        task_handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = reconciler.run() => {}
                _ = shutdown_rx.recv() => {}
            }
        }));
    }
    let drainer = StatusOutboxDrainer::new(
        store.clone(),
        store.clone(),
        Arc::new(bus.clone()),
        DrainerConfig {
            worker_id: "nh-dev".to_string(),
            ..Default::default()
        },
    );
    {
        let mut shutdown_rx = shutdown_tx.subscribe();
        task_handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = drainer.run() => {}
                _ = shutdown_rx.recv() => {}
            }
        }));
    }

    // Optional demo submission
    if let Some(webhook_url) = &args.demo_webhook {
        let ingest = IngestService::new(store.clone(), IngestServiceConfig::default());
        let request = NotificationRequest {
            request_id: uuid::Uuid::new_v4(),
            client_id: uuid::Uuid::new_v4(),
            client_name: Some("nh-dev".to_string()),
            channel: vec!["email".to_string()],
            provider: None,
            recipient: serde_json::json!({"email": "dev@example.com"}),
            content: serde_json::json!({
                "email": {"subject": "nh-dev demo", "message": "Hello from {{sender}}"}
            }),
            variables: Some(
                [("sender".to_string(), "nh-dev".to_string())].into_iter().collect(),
            ),
            scheduled_at: None,
            webhook_url: webhook_url.clone(),
        };
        match ingest.submit(&request).await {
            Ok(outcome) => info!(
                notification_id = %outcome.accepted[0].notification_id,
                "Demo notification submitted"
            ),
            Err(e) => error!(error = %e, "Demo submission failed"),
        }
    }

    // Metrics/health endpoint
    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], args.metrics_port));
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
    {
        let mut shutdown_rx = shutdown_tx.subscribe();
        task_handles.push(tokio::spawn(async move {
            axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        }));
    }

    info!("NotifyHub dev monolith started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        for handle in task_handles {
            let _ = handle.await;
        }
    })
    .await;

    info!("NotifyHub dev monolith shutdown complete");
    Ok(())
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
