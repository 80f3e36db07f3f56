//! WhatsApp provider speaking the Cloud-API message endpoint:
//! POST {api_base}/{phone_number_id}/messages with a bearer token.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::payload::{channel_slot, render_template, required_str};
use crate::providers::required_credential;
use crate::{Provider, ProviderError, ProviderManifest, RateLimitConfig, Result};
use nh_common::{DeliveryResult, NotificationPayload};

pub struct WhatsAppCloudProvider {
    id: String,
    client: Client,
    api_base: String,
    access_token: String,
    phone_number_id: String,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    messages: Option<Vec<MessageRef>>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

impl WhatsAppCloudProvider {
    pub fn from_entry(entry: &nh_config::PluginEntry, timeout: Duration) -> Result<Self> {
        let api_base = required_credential(entry, "api_base")?;
        let access_token = required_credential(entry, "access_token")?;
        let phone_number_id = required_credential(entry, "phone_number_id")?;

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        info!(provider_id = %entry.id, "WhatsAppCloudProvider initialized");

        Ok(Self {
            id: entry.id.clone(),
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            access_token,
            phone_number_id,
        })
    }

    fn extract(payload: &NotificationPayload) -> Result<(String, String)> {
        let recipient = channel_slot(&payload.recipient, "whatsapp");
        let phone = required_str(recipient, "phone")
            .ok_or_else(|| ProviderError::Validation("recipient.phone is required".to_string()))?;

        let content = channel_slot(&payload.content, "whatsapp");
        let message = required_str(content, "message")
            .ok_or_else(|| ProviderError::Validation("content.message is required".to_string()))?;

        Ok((
            phone.to_string(),
            render_template(message, payload.variables.as_ref()),
        ))
    }
}

#[async_trait]
impl Provider for WhatsAppCloudProvider {
    fn manifest(&self) -> ProviderManifest {
        ProviderManifest {
            id: self.id.clone(),
            name: "WhatsApp Cloud API".to_string(),
            channel: "whatsapp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            required_credentials: vec![
                "api_base".to_string(),
                "access_token".to_string(),
                "phone_number_id".to_string(),
            ],
        }
    }

    fn rate_limit(&self) -> RateLimitConfig {
        // WhatsApp business tiers throttle far below typical email volume
        RateLimitConfig {
            max_tokens: 20,
            refill_rate: 2.0,
        }
    }

    fn validate(&self, payload: &NotificationPayload) -> Result<()> {
        Self::extract(payload).map(|_| ())
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/{}", self.api_base, self.phone_number_id);
        match self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn send(&self, payload: &NotificationPayload) -> DeliveryResult {
        let (phone, message) = match Self::extract(payload) {
            Ok(parts) => parts,
            Err(e) => {
                return DeliveryResult::failure("INVALID_PAYLOAD", e.to_string(), false);
            }
        };

        let url = format!("{}/{}/messages", self.api_base, self.phone_number_id);
        let body = json!({
            "messaging_product": "whatsapp",
            "to": phone,
            "type": "text",
            "text": { "body": message },
        });

        debug!(
            notification_id = %payload.notification_id,
            to = %phone,
            "Sending WhatsApp message"
        );

        let response = match self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let kind = if e.is_timeout() { "TIMEOUT" } else { "CONNECTION" };
                warn!(
                    notification_id = %payload.notification_id,
                    error = %e,
                    "WhatsApp API request failed"
                );
                return DeliveryResult::failure(kind, e.to_string(), true);
            }
        };

        let status = response.status();
        let status_code = status.as_u16();

        if status.is_success() {
            let message_id = response
                .json::<SendMessageResponse>()
                .await
                .ok()
                .and_then(|r| r.messages)
                .and_then(|m| m.into_iter().next())
                .map(|m| m.id)
                .unwrap_or_else(|| payload.notification_id.clone());
            info!(
                notification_id = %payload.notification_id,
                message_id = %message_id,
                "WhatsApp message accepted"
            );
            return DeliveryResult::delivered(message_id);
        }

        let retryable = status_code == 429 || status.is_server_error();
        warn!(
            notification_id = %payload.notification_id,
            status_code = status_code,
            retryable = retryable,
            "WhatsApp API error"
        );
        DeliveryResult::failure(
            format!("HTTP_{}", status_code),
            format!("api returned {}", status_code),
            retryable,
        )
    }
}
