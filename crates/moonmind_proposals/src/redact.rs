//! Configurable secret redactor for proposal free text and JSON envelopes (spec §4.7
//! "Scrub all free-text fields and the whole JSON envelope through a configurable
//! secret redactor").
//!
//! The structural JSON walk (recurse into object/array, scrub only string leaves) is
//! grounded on `casparian_mcp::redaction::redact_value`. The substring patterns that
//! decide *what* looks like a secret are the same heuristics
//! `moonmind_contracts::manifest`'s leak scanner uses against raw manifest values,
//! re-purposed here to scrub-in-place rather than reject outright, since proposal text
//! is prose a reviewer still needs to read.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Tunable replacement text; default mirrors the original implementation's
/// `SecretRedactor.from_environ(placeholder="[REDACTED]")`.
#[derive(Debug, Clone)]
pub struct RedactorConfig {
    pub placeholder: String,
}

impl Default for RedactorConfig {
    fn default() -> Self {
        Self {
            placeholder: "[REDACTED]".to_string(),
        }
    }
}

fn prefixed_token_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(sk-|sk_live_|sk_test_|rk_live_|rk_test_|pk_live_|pk_test_|ghp_|gho_|ghu_|ghs_|ghr_|xoxp-|xoxb-|xapp-|ya29\.|AKIA|ASIA|EAAC|AIZA)[A-Za-z0-9_\-\.]{8,}",
        )
        .unwrap()
    })
}

fn key_value_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)\b(token|secret|password|api[_-]?key|client_secret|access_key)\s*[:=]\s*['"]?[^\s'",}]+"#,
        )
        .unwrap()
    })
}

fn jwt_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\b").unwrap()
    })
}

fn pem_block_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)-----BEGIN [A-Z ]+-----.*?-----END [A-Z ]+-----").unwrap())
}

/// Replace every secret-looking substring of `text` with `config.placeholder`. Order
/// matters: PEM blocks and prefixed tokens are replaced before the looser
/// key=value/JWT patterns so an already-redacted span isn't re-matched piecemeal.
pub fn scrub_text(config: &RedactorConfig, text: &str) -> String {
    let scrubbed = pem_block_pattern().replace_all(text, config.placeholder.as_str());
    let scrubbed = prefixed_token_pattern().replace_all(&scrubbed, config.placeholder.as_str());
    let scrubbed = key_value_pattern().replace_all(&scrubbed, |caps: &regex::Captures| {
        format!("{}={}", &caps[1], config.placeholder)
    });
    let scrubbed = jwt_pattern().replace_all(&scrubbed, config.placeholder.as_str());
    scrubbed.into_owned()
}

/// Recursively scrub every string leaf of a JSON value, preserving structure and keys.
pub fn scrub_value(config: &RedactorConfig, value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(scrub_text(config, s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| scrub_value(config, v)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), scrub_value(config, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scrubs_prefixed_api_tokens() {
        let cfg = RedactorConfig::default();
        let out = scrub_text(&cfg, "use key sk-abcdef1234567890 to authenticate");
        assert!(!out.contains("sk-abcdef1234567890"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn scrubs_key_value_secrets() {
        let cfg = RedactorConfig::default();
        let out = scrub_text(&cfg, "password=hunter2 in the logs");
        assert!(!out.contains("hunter2"));
    }

    #[test]
    fn leaves_ordinary_text_untouched() {
        let cfg = RedactorConfig::default();
        let text = "Retry the flaky test after the third failure.";
        assert_eq!(scrub_text(&cfg, text), text);
    }

    #[test]
    fn scrub_value_walks_nested_json() {
        let cfg = RedactorConfig::default();
        let value = json!({
            "a": "sk-abcdef1234567890",
            "b": ["fine", "ghp_abcdef1234567890"],
            "c": {"d": 1, "e": "fine too"}
        });
        let scrubbed = scrub_value(&cfg, &value);
        assert_eq!(scrubbed["a"], json!("[REDACTED]"));
        assert_eq!(scrubbed["b"][0], json!("fine"));
        assert_eq!(scrubbed["b"][1], json!("[REDACTED]"));
        assert_eq!(scrubbed["c"]["d"], json!(1));
        assert_eq!(scrubbed["c"]["e"], json!("fine too"));
    }
}
