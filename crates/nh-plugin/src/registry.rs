//! Provider registry: active providers keyed by id, grouped by channel
//! with priority ordering and explicit default/fallback selection.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{Provider, ProviderError, RateLimitConfig, Result};

#[derive(Debug, Clone, Default)]
struct ChannelEntry {
    /// (priority, provider id), kept sorted by descending priority.
    ranked: Vec<(i32, String)>,
    default_id: Option<String>,
    fallback_id: Option<String>,
}

/// Process-local provider registry.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn Provider>>,
    channels: RwLock<HashMap<String, ChannelEntry>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its manifest id. Registering the same id
    /// twice fails.
    pub fn register(&self, provider: Arc<dyn Provider>, priority: i32) -> Result<()> {
        let manifest = provider.manifest();

        if self.providers.contains_key(&manifest.id) {
            return Err(ProviderError::DuplicateId(manifest.id));
        }
        self.providers.insert(manifest.id.clone(), provider);

        let mut channels = self.channels.write();
        let entry = channels.entry(manifest.channel.clone()).or_default();
        entry.ranked.push((priority, manifest.id.clone()));
        entry.ranked.sort_by(|a, b| b.0.cmp(&a.0));

        info!(
            provider_id = %manifest.id,
            channel = %manifest.channel,
            priority = priority,
            "Provider registered"
        );
        Ok(())
    }

    /// Configure the explicit default and fallback for a channel.
    pub fn set_channel_defaults(
        &self,
        channel: &str,
        default_id: Option<String>,
        fallback_id: Option<String>,
    ) {
        for id in [&default_id, &fallback_id].into_iter().flatten() {
            if !self.providers.contains_key(id) {
                warn!(
                    provider_id = %id,
                    channel = %channel,
                    "Channel default names an unregistered provider"
                );
            }
        }

        let mut channels = self.channels.write();
        let entry = channels.entry(channel.to_string()).or_default();
        entry.default_id = default_id;
        entry.fallback_id = fallback_id;
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(id).map(|p| p.value().clone())
    }

    /// The channel's default provider: the explicit default when set and
    /// registered, otherwise the highest-priority registration.
    pub fn default_for(&self, channel: &str) -> Option<Arc<dyn Provider>> {
        let channels = self.channels.read();
        let entry = channels.get(channel)?;

        if let Some(id) = &entry.default_id {
            if let Some(provider) = self.get(id) {
                return Some(provider);
            }
        }
        entry
            .ranked
            .first()
            .and_then(|(_, id)| self.get(id))
    }

    /// The channel's configured fallback provider, if any.
    pub fn fallback_for(&self, channel: &str) -> Option<Arc<dyn Provider>> {
        let channels = self.channels.read();
        let entry = channels.get(channel)?;
        entry.fallback_id.as_ref().and_then(|id| self.get(id))
    }

    /// Providers registered for a channel in priority order.
    pub fn providers_for(&self, channel: &str) -> Vec<Arc<dyn Provider>> {
        let channels = self.channels.read();
        channels
            .get(channel)
            .map(|entry| {
                entry
                    .ranked
                    .iter()
                    .filter_map(|(_, id)| self.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All registered channels.
    pub fn channels(&self) -> Vec<String> {
        let channels = self.channels.read();
        channels.keys().cloned().collect()
    }

    /// Rate-limit introspection: the default provider's suggestion per
    /// channel, for seeding limiter configuration.
    pub fn rate_limit_for(&self, channel: &str) -> Option<RateLimitConfig> {
        self.default_for(channel).map(|p| p.rate_limit())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Shut down every provider. Called once at process exit.
    pub async fn shutdown_all(&self) {
        for item in self.providers.iter() {
            item.value().shutdown().await;
        }
        info!(count = self.providers.len(), "Providers shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nh_common::{DeliveryResult, NotificationPayload};

    struct FakeProvider {
        id: String,
        channel: String,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn manifest(&self) -> crate::ProviderManifest {
            crate::ProviderManifest {
                id: self.id.clone(),
                name: self.id.clone(),
                channel: self.channel.clone(),
                version: "1.0.0".to_string(),
                required_credentials: vec![],
            }
        }

        fn rate_limit(&self) -> RateLimitConfig {
            RateLimitConfig {
                max_tokens: 10,
                refill_rate: 1.0,
            }
        }

        fn validate(&self, _payload: &NotificationPayload) -> Result<()> {
            Ok(())
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn send(&self, _payload: &NotificationPayload) -> DeliveryResult {
            DeliveryResult::delivered("m-1")
        }
    }

    fn fake(id: &str, channel: &str) -> Arc<dyn Provider> {
        Arc::new(FakeProvider {
            id: id.to_string(),
            channel: channel.to_string(),
        })
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = ProviderRegistry::new();
        registry.register(fake("p1", "email"), 0).unwrap();

        let err = registry.register(fake("p1", "email"), 0).unwrap_err();
        assert!(matches!(err, ProviderError::DuplicateId(id) if id == "p1"));
    }

    #[test]
    fn test_default_follows_priority_without_explicit() {
        let registry = ProviderRegistry::new();
        registry.register(fake("low", "email"), 1).unwrap();
        registry.register(fake("high", "email"), 10).unwrap();

        let default = registry.default_for("email").unwrap();
        assert_eq!(default.manifest().id, "high");
    }

    #[test]
    fn test_explicit_default_and_fallback() {
        let registry = ProviderRegistry::new();
        registry.register(fake("a", "email"), 10).unwrap();
        registry.register(fake("b", "email"), 1).unwrap();
        registry.set_channel_defaults("email", Some("b".to_string()), Some("a".to_string()));

        assert_eq!(registry.default_for("email").unwrap().manifest().id, "b");
        assert_eq!(registry.fallback_for("email").unwrap().manifest().id, "a");
    }

    #[test]
    fn test_unknown_channel_has_no_default() {
        let registry = ProviderRegistry::new();
        registry.register(fake("p1", "email"), 0).unwrap();

        assert!(registry.default_for("sms").is_none());
        assert!(registry.fallback_for("email").is_none());
    }

    #[test]
    fn test_providers_for_ordered_by_priority() {
        let registry = ProviderRegistry::new();
        registry.register(fake("c", "email"), 5).unwrap();
        registry.register(fake("a", "email"), 20).unwrap();
        registry.register(fake("b", "email"), 10).unwrap();

        let ids: Vec<String> = registry
            .providers_for("email")
            .iter()
            .map(|p| p.manifest().id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
