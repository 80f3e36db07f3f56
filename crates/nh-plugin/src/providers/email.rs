//! Email provider backed by an HTTP mail gateway.
//!
//! Speaks a REST mail API: POST {api_base}/v1/messages with a bearer key.
//! Outcome classification: 2xx success, 429/5xx/transport retryable,
//! other 4xx a terminal configuration error.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::payload::{channel_slot, render_template, required_str};
use crate::providers::required_credential;
use crate::{Provider, ProviderError, ProviderManifest, RateLimitConfig, Result};
use nh_common::{DeliveryResult, NotificationPayload};

pub struct HttpEmailProvider {
    id: String,
    client: Client,
    api_base: String,
    api_key: String,
    from: String,
}

#[derive(Debug, Serialize)]
struct SendMailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendMailResponse {
    id: Option<String>,
}

impl HttpEmailProvider {
    pub fn from_entry(entry: &nh_config::PluginEntry, timeout: Duration) -> Result<Self> {
        let api_base = required_credential(entry, "api_base")?;
        let api_key = required_credential(entry, "api_key")?;
        let from = required_credential(entry, "from")?;

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        info!(provider_id = %entry.id, api_base = %api_base, "HttpEmailProvider initialized");

        Ok(Self {
            id: entry.id.clone(),
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            from,
        })
    }

    fn extract(payload: &NotificationPayload) -> Result<(String, String, String)> {
        let recipient = channel_slot(&payload.recipient, "email");
        let to = required_str(recipient, "email")
            .ok_or_else(|| ProviderError::Validation("recipient.email is required".to_string()))?;

        let content = channel_slot(&payload.content, "email");
        let subject = required_str(content, "subject")
            .ok_or_else(|| ProviderError::Validation("content.subject is required".to_string()))?;
        let message = required_str(content, "message")
            .ok_or_else(|| ProviderError::Validation("content.message is required".to_string()))?;

        let variables = payload.variables.as_ref();
        Ok((
            to.to_string(),
            render_template(subject, variables),
            render_template(message, variables),
        ))
    }
}

#[async_trait]
impl Provider for HttpEmailProvider {
    fn manifest(&self) -> ProviderManifest {
        ProviderManifest {
            id: self.id.clone(),
            name: "HTTP Email Gateway".to_string(),
            channel: "email".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            required_credentials: vec![
                "api_base".to_string(),
                "api_key".to_string(),
                "from".to_string(),
            ],
        }
    }

    fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_tokens: 100,
            refill_rate: 10.0,
        }
    }

    fn validate(&self, payload: &NotificationPayload) -> Result<()> {
        Self::extract(payload).map(|_| ())
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/v1/health", self.api_base);
        match self.client.get(&url).bearer_auth(&self.api_key).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn send(&self, payload: &NotificationPayload) -> DeliveryResult {
        let (to, subject, text) = match Self::extract(payload) {
            Ok(parts) => parts,
            Err(e) => {
                return DeliveryResult::failure("INVALID_PAYLOAD", e.to_string(), false);
            }
        };

        let url = format!("{}/v1/messages", self.api_base);
        let request = SendMailRequest {
            from: &self.from,
            to: &to,
            subject: &subject,
            text: &text,
        };

        debug!(
            notification_id = %payload.notification_id,
            to = %to,
            "Sending email"
        );

        let response = match self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let kind = if e.is_timeout() { "TIMEOUT" } else { "CONNECTION" };
                warn!(
                    notification_id = %payload.notification_id,
                    error = %e,
                    "Email gateway request failed"
                );
                return DeliveryResult::failure(kind, e.to_string(), true);
            }
        };

        let status = response.status();
        let status_code = status.as_u16();

        if status.is_success() {
            let message_id = response
                .json::<SendMailResponse>()
                .await
                .ok()
                .and_then(|r| r.id)
                .unwrap_or_else(|| payload.notification_id.clone());
            info!(
                notification_id = %payload.notification_id,
                message_id = %message_id,
                "Email accepted by gateway"
            );
            return DeliveryResult::delivered(message_id);
        }

        let body = response.text().await.unwrap_or_default();
        if status_code == 429 || status.is_server_error() {
            warn!(
                notification_id = %payload.notification_id,
                status_code = status_code,
                "Email gateway transient error"
            );
            DeliveryResult::failure(
                format!("HTTP_{}", status_code),
                format!("gateway returned {}: {}", status_code, truncate(&body, 200)),
                true,
            )
        } else {
            warn!(
                notification_id = %payload.notification_id,
                status_code = status_code,
                "Email gateway rejected message"
            );
            DeliveryResult::failure(
                format!("HTTP_{}", status_code),
                format!("gateway returned {}: {}", status_code, truncate(&body, 200)),
                false,
            )
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(api_base: &str) -> HttpEmailProvider {
        let entry = nh_config::PluginEntry {
            package: "nh-email-http".to_string(),
            id: "http-email".to_string(),
            credentials: [
                ("api_base", api_base),
                ("api_key", "k-test"),
                ("from", "noreply@example.com"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
            options: Default::default(),
        };
        HttpEmailProvider::from_entry(&entry, Duration::from_secs(5)).unwrap()
    }

    fn payload(content: serde_json::Value) -> NotificationPayload {
        NotificationPayload {
            notification_id: "n-1".to_string(),
            request_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            channel: "email".to_string(),
            provider: None,
            recipient: json!({"email": "a@x.test"}),
            content,
            variables: None,
            webhook_url: "http://w/1".to_string(),
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_validate_requires_recipient_email() {
        let provider = provider("https://mail.example.com");
        let mut p = payload(json!({"email": {"subject": "s", "message": "m"}}));
        p.recipient = json!({"phone": "123"});
        assert!(provider.validate(&p).is_err());
    }

    #[test]
    fn test_validate_accepts_channel_slot_and_flat_content() {
        let provider = provider("https://mail.example.com");
        assert!(provider
            .validate(&payload(json!({"email": {"subject": "s", "message": "m"}})))
            .is_ok());
        assert!(provider
            .validate(&payload(json!({"subject": "s", "message": "m"})))
            .is_ok());
        assert!(provider
            .validate(&payload(json!({"subject": "s"})))
            .is_err());
    }

    #[tokio::test]
    async fn test_send_success_returns_gateway_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("authorization", "Bearer k-test"))
            .and(body_partial_json(json!({"to": "a@x.test", "subject": "s"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "gw-1"})))
            .mount(&server)
            .await;

        let provider = provider(&server.uri());
        let result = provider
            .send(&payload(json!({"email": {"subject": "s", "message": "m"}})))
            .await;

        assert!(result.success);
        assert_eq!(result.message_id.as_deref(), Some("gw-1"));
    }

    #[tokio::test]
    async fn test_send_renders_variables() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({"text": "Hi Ada"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "gw-2"})))
            .mount(&server)
            .await;

        let provider = provider(&server.uri());
        let mut p = payload(json!({"email": {"subject": "s", "message": "Hi {{name}}"}}));
        p.variables = Some([("name".to_string(), "Ada".to_string())].into_iter().collect());

        let result = provider.send(&p).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = provider(&server.uri());
        let result = provider
            .send(&payload(json!({"subject": "s", "message": "m"})))
            .await;

        assert!(!result.success);
        assert!(result.is_retryable());
    }

    #[tokio::test]
    async fn test_client_error_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad address"))
            .mount(&server)
            .await;

        let provider = provider(&server.uri());
        let result = provider
            .send(&payload(json!({"subject": "s", "message": "m"})))
            .await;

        assert!(!result.success);
        assert!(!result.is_retryable());
        assert_eq!(result.error.unwrap().code, "HTTP_400");
    }

    #[tokio::test]
    async fn test_rate_limited_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let provider = provider(&server.uri());
        let result = provider
            .send(&payload(json!({"subject": "s", "message": "m"})))
            .await;

        assert!(!result.success);
        assert!(result.is_retryable());
    }
}
