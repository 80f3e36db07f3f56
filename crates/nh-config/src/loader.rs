//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "notifyhub.toml",
    "./config/config.toml",
    "./config/notifyhub.toml",
    "/etc/notifyhub/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        // Start with defaults
        let mut config = AppConfig::default();

        // Try to load from file
        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        // Check explicit path first
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        // Check NOTIFYHUB_CONFIG env var
        if let Ok(path) = env::var("NOTIFYHUB_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // Search standard paths
        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Bus
        if let Ok(val) = env::var("NOTIFYHUB_BUS_KIND") {
            config.bus.kind = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_BUS_SQLITE_PATH") {
            config.bus.sqlite_path = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_SQS_QUEUE_URL_PREFIX") {
            config.bus.sqs_queue_url_prefix = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_SQS_REGION") {
            config.bus.sqs_region = val;
        }

        // Store
        if let Ok(val) = env::var("NOTIFYHUB_STORE_KIND") {
            config.store.kind = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_STORE_URI") {
            config.store.uri = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_STORE_DATABASE") {
            config.store.database = val;
        }

        // Coordination store
        if let Ok(val) = env::var("NOTIFYHUB_COORD_KIND") {
            config.coord.kind = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_COORD_URL") {
            config.coord.url = val;
        }

        // Identity
        if let Ok(val) = env::var("NOTIFYHUB_WORKER_ID") {
            config.worker_id = val;
        }
        if let Ok(val) = env::var("NOTIFYHUB_CHANNELS") {
            config.channels = val.split(',').map(|s| s.trim().to_string()).collect();
        }

        // Delivery
        if let Ok(val) = env::var("NOTIFYHUB_MAX_RETRY_COUNT") {
            if let Ok(count) = val.parse() {
                config.delivery.max_retry_count = count;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_BASE_DELAY_MS") {
            if let Ok(ms) = val.parse() {
                config.delivery.base_delay_ms = ms;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_PROCESSING_TTL_SECONDS") {
            if let Ok(secs) = val.parse() {
                config.delivery.processing_ttl_seconds = secs;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_IDEMPOTENCY_TTL_SECONDS") {
            if let Ok(secs) = val.parse() {
                config.delivery.idempotency_ttl_seconds = secs;
            }
        }

        // Outbox
        if let Ok(val) = env::var("NOTIFYHUB_OUTBOX_POLL_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.outbox.poll_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_OUTBOX_BATCH_SIZE") {
            if let Ok(size) = val.parse() {
                config.outbox.batch_size = size;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_OUTBOX_CLAIM_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                config.outbox.claim_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_OUTBOX_RETENTION_MS") {
            if let Ok(ms) = val.parse() {
                config.outbox.retention_ms = ms;
            }
        }

        // Scheduled
        if let Ok(val) = env::var("NOTIFYHUB_SCHEDULED_POLL_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.scheduled.poll_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_SCHEDULED_BATCH_SIZE") {
            if let Ok(size) = val.parse() {
                config.scheduled.batch_size = size;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_SCHEDULED_MAX_POLLER_RETRIES") {
            if let Ok(count) = val.parse() {
                config.scheduled.max_poller_retries = count;
            }
        }

        // Recovery
        if let Ok(val) = env::var("NOTIFYHUB_RECOVERY_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.recovery.interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_RECOVERY_BATCH_SIZE") {
            if let Ok(size) = val.parse() {
                config.recovery.batch_size = size;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_RECOVERY_ORPHAN_THRESHOLD_MS") {
            if let Ok(ms) = val.parse() {
                config.recovery.orphan_threshold_ms = ms;
            }
        }

        // Webhook
        if let Ok(val) = env::var("NOTIFYHUB_WEBHOOK_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                config.webhook.timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var("NOTIFYHUB_WEBHOOK_SIGNING_SECRET") {
            config.webhook.signing_secret = Some(val);
        }

        // Plugins
        if let Ok(val) = env::var("NOTIFYHUB_PLUGIN_CONFIG") {
            config.plugin_config_path = val;
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
