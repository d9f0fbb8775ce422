//! Redaction of sensitive values in object snapshots.
//!
//! Request and response bodies frequently carry credentials (database
//! passwords, registry tokens, kubeconfig secrets). Values under sensitive
//! keys are replaced before a snapshot is attached to an audit event.

use serde_json::{Map, Value};

/// Placeholder written in place of a redacted value.
pub const REDACTED: &str = "[REDACTED]";

/// Key fragments whose values are always redacted.
pub const DEFAULT_SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "credential",
    "private_key",
    "api_key",
    "authorization",
];

/// Redacts values whose key contains a sensitive fragment (case-insensitive).
#[derive(Debug, Clone)]
pub struct Redactor {
    keys: Vec<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl Redactor {
    /// Create a redactor with the default keys plus `additional` ones.
    pub fn new(additional: &[String]) -> Self {
        let mut keys: Vec<String> = DEFAULT_SENSITIVE_KEYS
            .iter()
            .map(|k| k.to_string())
            .collect();
        for key in additional {
            let key = key.to_lowercase();
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
        Self { keys }
    }

    /// Return a copy of `value` with sensitive values replaced.
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut redacted = Map::new();
                for (key, val) in map {
                    if self.is_sensitive(key) {
                        redacted.insert(key.clone(), Value::String(REDACTED.to_string()));
                    } else {
                        redacted.insert(key.clone(), self.redact(val));
                    }
                }
                Value::Object(redacted)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            _ => value.clone(),
        }
    }

    fn is_sensitive(&self, key: &str) -> bool {
        let key_lower = key.to_lowercase();
        self.keys.iter().any(|k| key_lower.contains(k.as_str()))
    }
}
