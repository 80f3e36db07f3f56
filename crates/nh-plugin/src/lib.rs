//! Provider plugin contract and registry.
//!
//! Providers are statically linked; the plugin config file decides which
//! are enabled, under which id, with which credentials. A provider owns
//! its payload validation, its rate-limit defaults, and its send path.

use async_trait::async_trait;
use nh_common::{DeliveryResult, NotificationPayload};
use thiserror::Error;

pub mod payload;
pub mod providers;
pub mod registry;
pub mod router;

pub use registry::ProviderRegistry;
pub use router::ProviderRouter;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider {0} is already registered")]
    DuplicateId(String),

    #[error("Unknown provider package: {0}")]
    UnknownPackage(String),

    #[error("Missing credential {credential} for provider {provider}")]
    MissingCredential {
        provider: String,
        credential: String,
    },

    #[error("Invalid payload: {0}")]
    Validation(String),

    #[error("HTTP client error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Static description of a provider implementation.
#[derive(Debug, Clone)]
pub struct ProviderManifest {
    pub id: String,
    pub name: String,
    pub channel: String,
    pub version: String,
    pub required_credentials: Vec<String>,
}

/// Token-bucket parameters a provider suggests for its channel. The
/// plugin config may override them.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_tokens: u32,
    /// Tokens per second.
    pub refill_rate: f64,
}

/// A concrete sender for one channel.
///
/// Construction is initialization: a provider that cannot build its client
/// from the supplied credentials fails at registration, not at send time.
#[async_trait]
pub trait Provider: Send + Sync {
    fn manifest(&self) -> ProviderManifest;

    fn rate_limit(&self) -> RateLimitConfig;

    /// Validate the channel-shaped recipient and content before send.
    /// Runs in the dispatch consumer; failures drop the message as a
    /// poison pill.
    fn validate(&self, payload: &NotificationPayload) -> Result<()>;

    /// Verify the provider can reach its backend.
    async fn health_check(&self) -> bool;

    /// Deliver the notification. Errors are carried in the result, never
    /// thrown; `retryable` decides between backoff and fallback.
    async fn send(&self, payload: &NotificationPayload) -> DeliveryResult;

    /// Release resources on shutdown.
    async fn shutdown(&self) {}
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("manifest", &self.manifest())
            .finish()
    }
}
