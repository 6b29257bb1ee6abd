//! Redaction of credentials from payloads before they are logged.

use serde_json::{Map, Value};

/// Key fragments that mark a value as sensitive (matched case-insensitively).
const SENSITIVE_KEYS: &[&str] = &[
    "token",
    "password",
    "passwd",
    "secret",
    "auth",
    "credential",
    "api_key",
    "apikey",
    "private_key",
    "session_key",
    "cookie",
    "jwt",
    "bearer",
];

/// Characters kept at each end of a masked string.
const KEEP_CHARS: usize = 4;

/// Strings shorter than this are replaced entirely.
const MIN_PARTIAL_LEN: usize = 12;

const REDACTED: &str = "[REDACTED]";

/// Whether a JSON key names a sensitive value.
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|fragment| key.contains(fragment))
}

/// Mask a secret string, keeping a few leading and trailing characters.
#[must_use]
pub fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() < MIN_PARTIAL_LEN {
        return REDACTED.to_string();
    }
    let head: String = chars[..KEEP_CHARS].iter().collect();
    let tail: String = chars[chars.len() - KEEP_CHARS..].iter().collect();
    format!("{head}...{tail}")
}

/// Copy of `value` with every sensitive field masked, at any depth.
#[must_use]
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                let redacted = if is_sensitive_key(key) {
                    match inner {
                        Value::String(s) => Value::String(mask(s)),
                        Value::Null => Value::Null,
                        _ => Value::String(REDACTED.to_string()),
                    }
                } else {
                    redact(inner)
                };
                out.insert(key.clone(), redacted);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Redact a raw JSON text for logging.
///
/// Text that is not JSON is not echoed at all, since we cannot tell what it
/// contains.
#[must_use]
pub fn redact_text(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => redact(&value).to_string(),
        Err(_) => format!("<{} bytes of non-JSON payload>", text.len()),
    }
}
