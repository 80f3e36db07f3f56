//! Provider router: picks the provider for a notification and invokes its
//! send, with a single fallback hop for non-retryable failures.
//!
//! Retryable errors never fall back; the dispatch consumer retries the
//! same provider later through the scheduled queue.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ProviderRegistry;
use nh_common::{DeliveryResult, NotificationPayload, ERR_ALL_PROVIDERS_FAILED, ERR_NO_PROVIDER};

pub struct ProviderRouter {
    registry: Arc<ProviderRegistry>,
}

impl ProviderRouter {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Select a provider and deliver.
    ///
    /// Selection order: the notification's explicit provider (no fallback),
    /// else the channel default, with one fallback attempt only when the
    /// default fails non-retryably.
    pub async fn send_with_fallback(
        &self,
        channel: &str,
        payload: &NotificationPayload,
    ) -> DeliveryResult {
        // Explicitly requested provider: use it or fail, never fall back
        if let Some(provider_id) = &payload.provider {
            let Some(provider) = self.registry.get(provider_id) else {
                warn!(
                    notification_id = %payload.notification_id,
                    provider_id = %provider_id,
                    "Requested provider is not registered"
                );
                return DeliveryResult::failure(
                    ERR_NO_PROVIDER,
                    format!("provider {} is not registered", provider_id),
                    false,
                );
            };
            debug!(
                notification_id = %payload.notification_id,
                provider_id = %provider_id,
                "Sending via explicitly requested provider"
            );
            return provider.send(payload).await;
        }

        let Some(primary) = self.registry.default_for(channel) else {
            warn!(
                notification_id = %payload.notification_id,
                channel = %channel,
                "No provider registered for channel"
            );
            return DeliveryResult::failure(
                ERR_NO_PROVIDER,
                format!("no provider registered for channel {}", channel),
                false,
            );
        };

        let primary_id = primary.manifest().id;
        let result = primary.send(payload).await;

        if result.success {
            return result;
        }
        if result.is_retryable() {
            // The same provider gets retried later with backoff
            debug!(
                notification_id = %payload.notification_id,
                provider_id = %primary_id,
                "Primary failed retryably; no fallback"
            );
            return result;
        }

        let Some(fallback) = self.registry.fallback_for(channel) else {
            return result;
        };
        let fallback_id = fallback.manifest().id;
        if fallback_id == primary_id {
            return result;
        }

        info!(
            notification_id = %payload.notification_id,
            primary = %primary_id,
            fallback = %fallback_id,
            error = %result.error_message(),
            "Primary failed non-retryably; invoking fallback provider"
        );

        let fallback_result = fallback.send(payload).await;
        if fallback_result.success {
            return fallback_result;
        }

        let last_error = fallback_result.error_message();
        DeliveryResult::failure(
            ERR_ALL_PROVIDERS_FAILED,
            format!(
                "primary {}: {}; fallback {}: {}",
                primary_id,
                result.error_message(),
                fallback_id,
                last_error
            ),
            false,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Provider, ProviderManifest, RateLimitConfig, Result};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct ScriptedProvider {
        id: String,
        result: DeliveryResult,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(id: &str, result: DeliveryResult) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                result,
                calls: AtomicU32::new(0),
            })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn manifest(&self) -> ProviderManifest {
            ProviderManifest {
                id: self.id.clone(),
                name: self.id.clone(),
                channel: "email".to_string(),
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
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn payload(provider: Option<&str>) -> NotificationPayload {
        NotificationPayload {
            notification_id: "n-1".to_string(),
            request_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            channel: "email".to_string(),
            provider: provider.map(String::from),
            recipient: serde_json::json!({"email": "a@x"}),
            content: serde_json::json!({"subject": "s", "message": "m"}),
            variables: None,
            webhook_url: "http://w/1".to_string(),
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    fn router_with(
        primary: Arc<ScriptedProvider>,
        fallback: Option<Arc<ScriptedProvider>>,
    ) -> ProviderRouter {
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(primary.clone(), 10).unwrap();
        let fallback_id = fallback.as_ref().map(|f| f.id.clone());
        if let Some(f) = fallback {
            registry.register(f, 1).unwrap();
        }
        registry.set_channel_defaults("email", Some(primary.id.clone()), fallback_id);
        ProviderRouter::new(registry)
    }

    #[tokio::test]
    async fn test_no_provider_for_channel() {
        let registry = Arc::new(ProviderRegistry::new());
        let router = ProviderRouter::new(registry);

        let result = router.send_with_fallback("email", &payload(None)).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.code, ERR_NO_PROVIDER);
        assert!(!error.retryable);
    }

    #[tokio::test]
    async fn test_retryable_error_does_not_fall_back() {
        let primary = ScriptedProvider::new(
            "primary",
            DeliveryResult::failure("TIMEOUT", "timed out", true),
        );
        let fallback = ScriptedProvider::new("fallback", DeliveryResult::delivered("m-2"));
        let router = router_with(primary.clone(), Some(fallback.clone()));

        let result = router.send_with_fallback("email", &payload(None)).await;

        assert!(!result.success);
        assert!(result.is_retryable());
        assert_eq!(primary.call_count(), 1);
        assert_eq!(fallback.call_count(), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_error_falls_back_exactly_once() {
        let primary = ScriptedProvider::new(
            "primary",
            DeliveryResult::failure("INVALID_ADDRESS", "bad address", false),
        );
        let fallback = ScriptedProvider::new("fallback", DeliveryResult::delivered("m-2"));
        let router = router_with(primary.clone(), Some(fallback.clone()));

        let result = router.send_with_fallback("email", &payload(None)).await;

        assert!(result.success);
        assert_eq!(result.message_id.as_deref(), Some("m-2"));
        assert_eq!(primary.call_count(), 1);
        assert_eq!(fallback.call_count(), 1);
    }

    #[tokio::test]
    async fn test_both_failing_reports_all_providers_failed() {
        let primary = ScriptedProvider::new(
            "primary",
            DeliveryResult::failure("REJECTED", "policy reject", false),
        );
        let fallback = ScriptedProvider::new(
            "fallback",
            DeliveryResult::failure("REJECTED", "also rejected", false),
        );
        let router = router_with(primary, Some(fallback));

        let result = router.send_with_fallback("email", &payload(None)).await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.code, ERR_ALL_PROVIDERS_FAILED);
        assert!(!error.retryable);
    }

    #[tokio::test]
    async fn test_explicit_provider_never_falls_back() {
        let primary = ScriptedProvider::new(
            "primary",
            DeliveryResult::failure("REJECTED", "rejected", false),
        );
        let fallback = ScriptedProvider::new("fallback", DeliveryResult::delivered("m-2"));
        let router = router_with(primary.clone(), Some(fallback.clone()));

        let result = router
            .send_with_fallback("email", &payload(Some("primary")))
            .await;

        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, "REJECTED");
        assert_eq!(fallback.call_count(), 0);
    }

    #[tokio::test]
    async fn test_explicit_unregistered_provider_is_terminal() {
        let primary = ScriptedProvider::new("primary", DeliveryResult::delivered("m-1"));
        let router = router_with(primary.clone(), None);

        let result = router
            .send_with_fallback("email", &payload(Some("missing")))
            .await;

        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, ERR_NO_PROVIDER);
        assert_eq!(primary.call_count(), 0);
    }
}
