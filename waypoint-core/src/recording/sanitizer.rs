use serde_json::Value;
use std::collections::HashMap;

/// Headers that carry credentials and must be redacted.
pub const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie", "x-goog-api-key"];

/// Query parameters that carry credentials.
pub const SENSITIVE_QUERY_KEYS: &[&str] = &["key", "access_token"];

/// JSON object keys whose values are replaced wholesale.
pub const SENSITIVE_JSON_KEYS: &[&str] = &["token", "secret", "password", "key", "api_key"];

const REDACTED: &str = "[REDACTED]";

pub struct Sanitizer;

impl Sanitizer {
    pub fn is_sensitive_header(header_name: &str) -> bool {
        let lower = header_name.to_lowercase();
        SENSITIVE_HEADERS.contains(&lower.as_str())
    }

    /// Remove sensitive data from headers
    pub fn sanitize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(key, value)| {
                let value = if Self::is_sensitive_header(key) {
                    REDACTED.to_string()
                } else {
                    value.clone()
                };
                (key.clone(), value)
            })
            .collect()
    }

    /// Redact credential-bearing query parameters. Unparseable input is
    /// returned unchanged.
    pub fn sanitize_url(raw: &str) -> String {
        let Ok(mut url) = url::Url::parse(raw) else {
            return raw.to_string();
        };
        if url.query().is_none() {
            return raw.to_string();
        }

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| {
                let v = if SENSITIVE_QUERY_KEYS.contains(&k.to_lowercase().as_str()) {
                    REDACTED.to_string()
                } else {
                    v.into_owned()
                };
                (k.into_owned(), v)
            })
            .collect();

        url.query_pairs_mut().clear().extend_pairs(pairs);
        url.to_string()
    }

    /// Remove sensitive data from JSON payloads
    pub fn sanitize_json(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sanitized = serde_json::Map::new();
                for (key, val) in map {
                    let sanitized_val = if SENSITIVE_JSON_KEYS.contains(&key.as_str()) {
                        Value::String(REDACTED.to_string())
                    } else {
                        Self::sanitize_json(val)
                    };
                    sanitized.insert(key.clone(), sanitized_val);
                }
                Value::Object(sanitized)
            }
            Value::Array(arr) => Value::Array(arr.iter().map(Self::sanitize_json).collect()),
            _ => value.clone(),
        }
    }

    /// Sanitize a textual body: JSON is scrubbed key by key, anything else
    /// is kept as is.
    pub fn sanitize_body(body: &str) -> String {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => Self::sanitize_json(&value).to_string(),
            Err(_) => body.to_string(),
        }
    }
}
