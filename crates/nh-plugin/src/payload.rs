//! Channel-shaped payload extraction and template rendering.
//!
//! Recipient and content travel as opaque JSON. A channel's slice may sit
//! under a key named after the channel (`content.email`) or flat at the
//! top level; extraction prefers the channel slot and falls back to the
//! whole object.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// The channel's slice of a channel-shaped object.
pub fn channel_slot<'a>(value: &'a Value, channel: &str) -> &'a Value {
    match value.get(channel) {
        Some(slot) if slot.is_object() => slot,
        _ => value,
    }
}

/// Replace `{{name}}` placeholders from the variables map. Unknown
/// placeholders are left in place so a missing variable is visible in the
/// delivered message rather than silently blanked.
pub fn render_template(text: &str, variables: Option<&HashMap<String, String>>) -> String {
    let Some(variables) = variables else {
        return text.to_string();
    };
    if variables.is_empty() {
        return text.to_string();
    }

    let re = Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").expect("static regex");
    re.replace_all(text, |caps: &regex::Captures| {
        variables
            .get(&caps[1])
            .cloned()
            .unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

/// A required string field of a channel slot.
pub fn required_str<'a>(slot: &'a Value, field: &str) -> Option<&'a str> {
    slot.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_slot_prefers_channel_key() {
        let content = json!({"email": {"subject": "s", "message": "m"}});
        let slot = channel_slot(&content, "email");
        assert_eq!(slot["subject"], "s");
    }

    #[test]
    fn test_channel_slot_falls_back_to_flat() {
        let content = json!({"subject": "s", "message": "m"});
        let slot = channel_slot(&content, "email");
        assert_eq!(slot["message"], "m");
    }

    #[test]
    fn test_render_template_substitutes() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "Ada".to_string());
        vars.insert("code".to_string(), "1234".to_string());

        let out = render_template("Hi {{name}}, your code is {{ code }}", Some(&vars));
        assert_eq!(out, "Hi Ada, your code is 1234");
    }

    #[test]
    fn test_render_template_keeps_unknown_placeholders() {
        let vars = HashMap::new();
        let out = render_template("Hi {{name}}", Some(&vars));
        assert_eq!(out, "Hi {{name}}");
    }

    #[test]
    fn test_required_str_rejects_empty() {
        let slot = json!({"email": "", "phone": "123"});
        assert!(required_str(&slot, "email").is_none());
        assert_eq!(required_str(&slot, "phone"), Some("123"));
        assert!(required_str(&slot, "missing").is_none());
    }
}
