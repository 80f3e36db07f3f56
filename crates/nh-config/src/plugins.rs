//! Plugin configuration file
//!
//! Providers are statically linked; this file decides which of them are
//! enabled, under which id, with which credentials. Credential values may
//! reference environment variables as `${VAR_NAME}`, resolved at load time.

use crate::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A single provider entry in the plugin config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEntry {
    /// Provider package name, e.g. "nh-email-http".
    pub package: String,
    /// Registry id for this instance, e.g. "http-email".
    pub id: String,
    /// Credential map; values support `${ENV_VAR}` interpolation.
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    #[serde(default)]
    pub options: PluginOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginOptions {
    /// Higher priority providers are preferred within a channel.
    pub priority: i32,
    /// Overrides the provider's built-in rate limit when set.
    pub rate_limit: Option<PluginRateLimit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRateLimit {
    pub max_tokens: u32,
    pub refill_rate: f64,
}

/// Parsed plugin configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default, rename = "provider")]
    pub providers: Vec<PluginEntry>,
}

impl PluginConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let mut config: PluginConfig = toml::from_str(contents)?;
        for entry in &mut config.providers {
            for value in entry.credentials.values_mut() {
                *value = interpolate_env(value)?;
            }
        }
        Ok(config)
    }
}

/// Replace every `${VAR}` occurrence with the named environment variable.
/// A missing variable is a configuration error, not an empty string.
fn interpolate_env(value: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex");
    let mut result = String::with_capacity(value.len());
    let mut last = 0;

    for caps in re.captures_iter(value) {
        let m = caps.get(0).expect("match 0");
        let var_name = &caps[1];
        let resolved = std::env::var(var_name)
            .map_err(|_| ConfigError::EnvError(format!("{} is not set", var_name)))?;
        result.push_str(&value[last..m.start()]);
        result.push_str(&resolved);
        last = m.end();
    }
    result.push_str(&value[last..]);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plugin_config() {
        let toml_str = r#"
            [[provider]]
            package = "nh-email-http"
            id = "http-email"

            [provider.credentials]
            api_base = "https://mail.example.com"
            api_key = "k-123"

            [provider.options]
            priority = 10

            [provider.options.rate_limit]
            max_tokens = 5
            refill_rate = 1.0

            [[provider]]
            package = "nh-whatsapp-cloud"
            id = "whatsapp-cloud"

            [provider.credentials]
            access_token = "t-456"
            phone_number_id = "1555"
        "#;

        let config = PluginConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].id, "http-email");
        assert_eq!(config.providers[0].options.priority, 10);
        let limit = config.providers[0].options.rate_limit.as_ref().unwrap();
        assert_eq!(limit.max_tokens, 5);
        assert_eq!(
            config.providers[1].credentials.get("access_token").unwrap(),
            "t-456"
        );
    }

    #[test]
    fn test_env_interpolation() {
        std::env::set_var("NH_TEST_PLUGIN_KEY", "secret-value");
        let toml_str = r#"
            [[provider]]
            package = "nh-email-http"
            id = "http-email"

            [provider.credentials]
            api_key = "${NH_TEST_PLUGIN_KEY}"
            endpoint = "https://api.example.com/${NH_TEST_PLUGIN_KEY}/send"
        "#;

        let config = PluginConfig::from_toml(toml_str).unwrap();
        let creds = &config.providers[0].credentials;
        assert_eq!(creds.get("api_key").unwrap(), "secret-value");
        assert_eq!(
            creds.get("endpoint").unwrap(),
            "https://api.example.com/secret-value/send"
        );
    }

    #[test]
    fn test_missing_env_var_is_error() {
        let toml_str = r#"
            [[provider]]
            package = "nh-email-http"
            id = "http-email"

            [provider.credentials]
            api_key = "${NH_TEST_DEFINITELY_UNSET_VAR}"
        "#;

        assert!(PluginConfig::from_toml(toml_str).is_err());
    }
}
