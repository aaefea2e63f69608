//! Content hashing
//!
//! Every identity in the cache is a SHA256 digest of canonical JSON:
//! mapping keys sorted recursively, volatile keys (proxies, mirrors,
//! credentials) removed. The index stores full digests; only human-facing
//! tags use the short prefix.

use crate::error::ImgdepsResult;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Length of the digest prefix used in image tags
pub const SHORT_HASH_LEN: usize = 12;

/// Keys stripped before hashing. Matched case-insensitively.
pub const DEFAULT_IGNORE_KEYS: &[&str] = &[
    "http_proxy",
    "https_proxy",
    "ftp_proxy",
    "socks_proxy",
    "no_proxy",
    "all_proxy",
    "apt_mirror",
    "pip_index_url",
    "pip_extra_index_url",
    "mirror",
    "mirrors",
    "credentials",
    "password",
    "token",
];

/// Canonicalizes and hashes declared content
#[derive(Debug, Clone)]
pub struct ContentHasher {
    ignore: BTreeSet<String>,
}

impl ContentHasher {
    /// Create a hasher that drops the given keys (in addition to nothing else)
    pub fn new<I, S>(ignore_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            ignore: ignore_keys
                .into_iter()
                .map(|k| k.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Default ignore list plus any extra keys from engine settings
    pub fn with_extra<S: AsRef<str>>(extra: &[S]) -> Self {
        Self::new(
            DEFAULT_IGNORE_KEYS
                .iter()
                .map(|k| k.to_string())
                .chain(extra.iter().map(|k| k.as_ref().to_string())),
        )
    }

    fn is_ignored(&self, key: &str) -> bool {
        self.ignore.contains(&key.to_ascii_lowercase())
    }

    /// Sort mapping keys recursively and drop ignored keys
    pub fn canonicalize(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> =
                    map.keys().filter(|k| !self.is_ignored(k)).collect();
                keys.sort();
                let mut out = Map::new();
                for key in keys {
                    out.insert(key.clone(), self.canonicalize(&map[key.as_str()]));
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.canonicalize(v)).collect())
            }
            other => other.clone(),
        }
    }

    /// Hash an already-built JSON value
    pub fn digest_value(&self, value: &Value) -> String {
        let canonical = self.canonicalize(value);
        // Value's Display is compact JSON and cannot fail
        sha256_hex(canonical.to_string().as_bytes())
    }

    /// Hash any serializable content
    pub fn digest<T: Serialize>(&self, content: &T) -> ImgdepsResult<String> {
        let value = serde_json::to_value(content)?;
        Ok(self.digest_value(&value))
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::with_extra::<&str>(&[])
    }
}

/// SHA256 of raw bytes as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Digest of an ordered list of string parts, separated so that
/// `["ab", "c"]` and `["a", "bc"]` differ
pub fn digest_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Short prefix for tags and display
pub fn short(hash: &str) -> &str {
    &hash[..SHORT_HASH_LEN.min(hash.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_hash() {
        let hasher = ContentHasher::default();
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": [1, 2], "x": "v"}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": "v", "y": [1, 2]}, "b": 1}"#).unwrap();
        assert_eq!(hasher.digest_value(&a), hasher.digest_value(&b));
    }

    #[test]
    fn ignored_keys_do_not_change_hash() {
        let hasher = ContentHasher::default();
        let plain = json!({"commands": ["make install"], "env": {"LANG": "C"}});
        let proxied = json!({
            "commands": ["make install"],
            "env": {"LANG": "C", "HTTP_PROXY": "http://proxy:3128", "no_proxy": "localhost"},
            "mirror": "http://mirror.local/debian"
        });
        assert_eq!(hasher.digest_value(&plain), hasher.digest_value(&proxied));
    }

    #[test]
    fn array_order_is_significant() {
        let hasher = ContentHasher::default();
        let a = json!({"commands": ["a", "b"]});
        let b = json!({"commands": ["b", "a"]});
        assert_ne!(hasher.digest_value(&a), hasher.digest_value(&b));
    }

    #[test]
    fn extra_ignore_keys_are_honored() {
        let hasher = ContentHasher::with_extra(&["BUILD_DATE"]);
        let a = json!({"x": 1, "build_date": "2026-01-01"});
        let b = json!({"x": 1});
        assert_eq!(hasher.digest_value(&a), hasher.digest_value(&b));
    }

    #[test]
    fn digest_is_full_width() {
        let hash = ContentHasher::default().digest(&json!({"a": 1})).unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(short(&hash).len(), SHORT_HASH_LEN);
    }

    #[test]
    fn digest_parts_is_unambiguous() {
        assert_ne!(digest_parts(&["ab", "c"]), digest_parts(&["a", "bc"]));
        assert_eq!(digest_parts(&["a", "b"]), digest_parts(&["a", "b"]));
    }
}
