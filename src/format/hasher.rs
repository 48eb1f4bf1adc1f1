//! Salted hashing of sensitive values.
//!
//! Every string leaf in a payload is replaced by its HMAC. Values under
//! credential-like keys are hashed whole, including numbers and nested
//! objects, so their shape is not revealed either.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::salt::Salt;

/// Key fragments whose values are always hashed as a whole.
const CREDENTIAL_KEYS: &[&str] = &[
    "password",
    "passphrase",
    "secret",
    "token",
    "credential",
    "private_key",
    "api_key",
    "access_key",
    "client_key",
];

/// Stable byte form of a JSON value.
///
/// Strings hash their raw UTF-8 so a token matches a direct HMAC of the
/// same text. Everything else is compact JSON with object keys sorted.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.as_bytes().to_vec(),
        other => {
            let mut out = Vec::new();
            write_canonical(other, &mut out);
            out
        }
    }
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(&map[key], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

/// Applies one device's salt to values.
pub struct Hasher<'a> {
    salt: &'a Salt,
    extra_keys: &'a BTreeSet<String>,
}

impl<'a> Hasher<'a> {
    pub fn new(salt: &'a Salt, extra_keys: &'a BTreeSet<String>) -> Self {
        Self { salt, extra_keys }
    }

    pub fn hash_str(&self, value: &str) -> String {
        self.salt.identified_hmac(value.as_bytes())
    }

    pub fn hash_value(&self, value: &Value) -> String {
        self.salt.identified_hmac(&canonical_bytes(value))
    }

    /// Redact a payload, leaving the named top-level keys in clear.
    pub fn redact_data(&self, data: &Value, exempt: &BTreeSet<String>) -> Value {
        match data {
            Value::Object(map) => {
                let mut redacted = Map::new();
                for (key, value) in map {
                    let out = if exempt.contains(&key.to_lowercase()) {
                        value.clone()
                    } else {
                        self.redact_entry(key, value)
                    };
                    redacted.insert(key.clone(), out);
                }
                Value::Object(redacted)
            }
            other => self.redact_value(other),
        }
    }

    fn redact_entry(&self, key: &str, value: &Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        if self.is_credential_key(key) {
            return Value::String(self.hash_value(value));
        }
        self.redact_value(value)
    }

    fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_entry(k, v)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::String(s) => Value::String(self.hash_str(s)),
            _ => value.clone(),
        }
    }

    fn is_credential_key(&self, key: &str) -> bool {
        let key_lower = key.to_lowercase();
        self.extra_keys.contains(&key_lower)
            || CREDENTIAL_KEYS.iter().any(|&s| key_lower.contains(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::salt::{HMAC_PREFIX, SALT_LEN};
    use serde_json::json;
    use uuid::Uuid;

    fn salt() -> Salt {
        Salt::from_bytes(Uuid::nil(), &[5u8; SALT_LEN])
    }

    #[test]
    fn test_canonical_bytes_sorts_keys() {
        let a = json!({"b": 1, "a": [true, null, "x"]});
        let b = json!({"a": [true, null, "x"], "b": 1});
        assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
        assert_eq!(canonical_bytes(&a), br#"{"a":[true,null,"x"],"b":1}"#.to_vec());
        assert_eq!(canonical_bytes(&json!("plain")), b"plain".to_vec());
    }

    #[test]
    fn test_string_leaves_hashed() {
        let salt = salt();
        let none = BTreeSet::new();
        let hasher = Hasher::new(&salt, &none);

        let out = hasher.redact_data(
            &json!({"name": "db", "ttl": 30, "enabled": true, "tags": ["a", "b"]}),
            &none,
        );
        assert_eq!(out["name"], json!(salt.identified_hmac(b"db")));
        assert_eq!(out["ttl"], json!(30));
        assert_eq!(out["enabled"], json!(true));
        assert_eq!(out["tags"][1], json!(salt.identified_hmac(b"b")));
    }

    #[test]
    fn test_credential_keys_hashed_whole() {
        let salt = salt();
        let extra: BTreeSet<String> = ["ssn".to_string()].into();
        let none = BTreeSet::new();
        let hasher = Hasher::new(&salt, &extra);

        let out = hasher.redact_data(
            &json!({
                "db_password": 12345,
                "Client_Token": {"nested": "value"},
                "ssn": 123456789,
                "port": 5432
            }),
            &none,
        );
        assert_eq!(out["db_password"], json!(hasher.hash_value(&json!(12345))));
        assert!(out["Client_Token"].as_str().unwrap().starts_with(HMAC_PREFIX));
        assert!(out["ssn"].as_str().unwrap().starts_with(HMAC_PREFIX));
        assert_eq!(out["port"], json!(5432));
    }

    #[test]
    fn test_exempt_top_level_keys() {
        let salt = salt();
        let none = BTreeSet::new();
        let exempt: BTreeSet<String> = ["username".to_string()].into();
        let hasher = Hasher::new(&salt, &none);

        let out = hasher.redact_data(
            &json!({"username": "alice", "nested": {"username": "bob"}}),
            &exempt,
        );
        assert_eq!(out["username"], json!("alice"));
        assert_ne!(out["nested"]["username"], json!("bob"));
    }

    #[test]
    fn test_redaction_is_deterministic() {
        let salt = salt();
        let none = BTreeSet::new();
        let hasher = Hasher::new(&salt, &none);
        let data = json!({"users": [{"name": "u1", "password": "p1"}]});

        assert_eq!(hasher.redact_data(&data, &none), hasher.redact_data(&data, &none));
    }

    #[test]
    fn test_nulls_preserved() {
        let salt = salt();
        let none = BTreeSet::new();
        let hasher = Hasher::new(&salt, &none);
        let out = hasher.redact_data(&json!({"secret": null}), &none);
        assert_eq!(out["secret"], Value::Null);
    }
}
