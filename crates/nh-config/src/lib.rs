//! NotifyHub Configuration System
//!
//! This crate provides TOML-based configuration with environment variable
//! override support, plus the plugin configuration file that binds provider
//! packages to channels with `${ENV_VAR}`-interpolated credentials.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

mod loader;
mod plugins;

pub use loader::ConfigLoader;
pub use plugins::{PluginConfig, PluginEntry, PluginOptions, PluginRateLimit};

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bus: BusConfig,
    pub store: StoreConfig,
    pub coord: CoordConfig,
    pub delivery: DeliveryConfig,
    pub outbox: OutboxConfig,
    pub scheduled: ScheduledConfig,
    pub recovery: RecoveryConfig,
    pub webhook: WebhookConfig,
    pub ingest: IngestConfig,

    /// Channels this deployment consumes; one dispatch consumer per entry.
    pub channels: Vec<String>,

    /// Per-channel rate limits and provider defaults, keyed by channel name.
    pub channel: HashMap<String, ChannelConfig>,

    /// Unique identifier for this worker process (claims, queue leases).
    pub worker_id: String,

    /// Path to the plugin configuration file.
    pub plugin_config_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            store: StoreConfig::default(),
            coord: CoordConfig::default(),
            delivery: DeliveryConfig::default(),
            outbox: OutboxConfig::default(),
            scheduled: ScheduledConfig::default(),
            recovery: RecoveryConfig::default(),
            webhook: WebhookConfig::default(),
            ingest: IngestConfig::default(),
            channels: vec!["email".to_string(), "whatsapp".to_string()],
            channel: HashMap::new(),
            worker_id: uuid::Uuid::new_v4().to_string(),
            plugin_config_path: "plugins.toml".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one channel must be configured".to_string(),
            ));
        }
        if self.delivery.max_retry_count == 0 {
            return Err(ConfigError::ValidationError(
                "delivery.max_retry_count must be at least 1".to_string(),
            ));
        }
        for (name, ch) in &self.channel {
            if ch.refill_rate <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "channel.{}.refill_rate must be positive",
                    name
                )));
            }
            if ch.max_tokens == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "channel.{}.max_tokens must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Rate limit for a channel, falling back to the defaults.
    pub fn channel_limits(&self, channel: &str) -> (u32, f64) {
        self.channel
            .get(channel)
            .map(|c| (c.max_tokens, c.refill_rate))
            .unwrap_or((ChannelConfig::DEFAULT_MAX_TOKENS, ChannelConfig::DEFAULT_REFILL_RATE))
    }
}

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Backend kind: "sqlite" (embedded) or "sqs".
    pub kind: String,
    /// SQLite database path for the embedded bus ("sqlite::memory:" for tests).
    pub sqlite_path: String,
    /// Queue URL prefix for SQS; the topic name is appended with ".fifo".
    pub sqs_queue_url_prefix: String,
    pub sqs_region: String,
    pub visibility_timeout_seconds: u32,
    pub wait_time_seconds: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: "sqlite".to_string(),
            sqlite_path: "./data/bus.db".to_string(),
            sqs_queue_url_prefix: String::new(),
            sqs_region: "us-east-1".to_string(),
            visibility_timeout_seconds: 120,
            wait_time_seconds: 5,
        }
    }
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend kind: "mongodb" or "sqlite".
    pub kind: String,
    pub uri: String,
    pub database: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: "mongodb".to_string(),
            uri: "mongodb://localhost:27017/?replicaSet=rs0&directConnection=true".to_string(),
            database: "notifyhub".to_string(),
        }
    }
}

/// Coordination store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    /// Backend kind: "redis" or "memory" (single-process dev only).
    pub kind: String,
    pub url: String,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            kind: "redis".to_string(),
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// Delivery retry and locking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Maximum retry attempts per notification before terminal failure.
    pub max_retry_count: i32,
    /// Base for the exponential backoff `2^(n+1) * base_delay_ms`.
    pub base_delay_ms: u64,
    /// TTL of the `processing` idempotency lock. Must expire before the
    /// bus redelivers, so a crashed sender's lock does not reject the retry.
    pub processing_ttl_seconds: u64,
    /// TTL of the delivered/failed de-dup window.
    pub idempotency_ttl_seconds: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            base_delay_ms: 1000,
            processing_ttl_seconds: 60,
            idempotency_ttl_seconds: 86_400,
        }
    }
}

/// Outbox dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    /// Claim lease; rows claimed longer ago than this are reclaimable.
    pub claim_timeout_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Published rows older than this are deleted by the cleanup pass.
    pub retention_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            batch_size: 100,
            claim_timeout_ms: 30_000,
            cleanup_interval_ms: 60_000,
            retention_ms: 86_400_000,
        }
    }
}

/// Scheduled queue poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduledConfig {
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    /// TTL of the per-entry claim key.
    pub claim_timeout_ms: u64,
    /// Publish attempts before a scheduled entry is failed terminally.
    pub max_poller_retries: u32,
}

impl Default for ScheduledConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 100,
            claim_timeout_ms: 30_000,
            max_poller_retries: 5,
        }
    }
}

/// Recovery reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub interval_ms: u64,
    pub batch_size: u32,
    /// Age after which a pending notification counts as orphaned.
    pub orphan_threshold_ms: u64,
    /// Orphan count that raises a warning alert.
    pub orphan_alert_threshold: u64,
    /// Orphan count that escalates the alert to critical.
    pub orphan_critical_threshold: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            batch_size: 100,
            orphan_threshold_ms: 300_000,
            orphan_alert_threshold: 10,
            orphan_critical_threshold: 100,
        }
    }
}

/// Client webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub timeout_ms: u64,
    /// When set, callbacks carry HMAC-SHA256 signature headers.
    pub signing_secret: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            signing_secret: None,
        }
    }
}

/// Ingest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Ceiling on `|recipients| x |channels|` for a batch submission.
    pub max_batch_effective: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_batch_effective: 1000,
        }
    }
}

/// Per-channel rate limit and provider defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub max_tokens: u32,
    /// Tokens per second.
    pub refill_rate: f64,
    pub default_provider: Option<String>,
    pub fallback_provider: Option<String>,
}

impl ChannelConfig {
    pub const DEFAULT_MAX_TOKENS: u32 = 100;
    pub const DEFAULT_REFILL_RATE: f64 = 10.0;
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            refill_rate: Self::DEFAULT_REFILL_RATE,
            default_provider: None,
            fallback_provider: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.delivery.base_delay_ms, 1000);
        assert_eq!(config.outbox.batch_size, 100);
    }

    #[test]
    fn test_channel_limits_fallback() {
        let mut config = AppConfig::default();
        config.channel.insert(
            "email".to_string(),
            ChannelConfig {
                max_tokens: 5,
                refill_rate: 0.5,
                ..Default::default()
            },
        );

        assert_eq!(config.channel_limits("email"), (5, 0.5));
        assert_eq!(
            config.channel_limits("sms"),
            (ChannelConfig::DEFAULT_MAX_TOKENS, ChannelConfig::DEFAULT_REFILL_RATE)
        );
    }

    #[test]
    fn test_rejects_zero_refill_rate() {
        let mut config = AppConfig::default();
        config.channel.insert(
            "email".to_string(),
            ChannelConfig {
                refill_rate: 0.0,
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            channels = ["email"]
            worker_id = "worker-1"

            [store]
            kind = "sqlite"
            uri = "sqlite::memory:"

            [delivery]
            max_retry_count = 5

            [channel.email]
            max_tokens = 1
            refill_rate = 0.5
            default_provider = "http-email"
        "#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.worker_id, "worker-1");
        assert_eq!(config.delivery.max_retry_count, 5);
        assert_eq!(config.channel_limits("email"), (1, 0.5));
        assert_eq!(
            config.channel.get("email").unwrap().default_provider.as_deref(),
            Some("http-email")
        );
    }
}
