//! Built-in, statically linked providers.

pub mod email;
pub mod whatsapp;

use std::sync::Arc;
use std::time::Duration;

use crate::{Provider, ProviderError, Result};
use nh_config::PluginEntry;

pub use email::HttpEmailProvider;
pub use whatsapp::WhatsAppCloudProvider;

/// Build a provider from a plugin config entry. The package name selects
/// the implementation; new providers are added here without touching the
/// pipeline.
pub fn build_provider(entry: &PluginEntry, timeout: Duration) -> Result<Arc<dyn Provider>> {
    match entry.package.as_str() {
        "nh-email-http" => Ok(Arc::new(HttpEmailProvider::from_entry(entry, timeout)?)),
        "nh-whatsapp-cloud" => Ok(Arc::new(WhatsAppCloudProvider::from_entry(entry, timeout)?)),
        other => Err(ProviderError::UnknownPackage(other.to_string())),
    }
}

pub(crate) fn required_credential(entry: &PluginEntry, name: &str) -> Result<String> {
    entry
        .credentials
        .get(name)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| ProviderError::MissingCredential {
            provider: entry.id.clone(),
            credential: name.to_string(),
        })
}
