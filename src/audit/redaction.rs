//! Masking of sensitive fields in structured records.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Replacement written over sensitive values.
pub const REDACTED: &str = "[REDACTED]";

fn sensitive_key() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)secret|token|password|api[-_]?key|authorization")
            .expect("redaction pattern is a valid regex")
    })
}

/// Whether a field name looks like it holds a credential.
pub fn is_sensitive_key(key: &str) -> bool {
    sensitive_key().is_match(key)
}

/// Replace the value of every sensitive key, at any depth, with [`REDACTED`].
pub fn redact_sensitive(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, val)| {
                    if is_sensitive_key(&key) {
                        (key, Value::String(REDACTED.to_string()))
                    } else {
                        (key, redact_sensitive(val))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact_sensitive).collect()),
        other => other,
    }
}
