//! Key generation utilities for rate limiting.

use std::fmt;
use std::fmt::Write as _;

/// Sub-resource used when the caller does not name one.
pub const GLOBAL_LIMIT_KEY: &str = "global";

const PREFIX: &str = "ratelimit";

/// Identity of one rate budget: a client, optionally narrowed to a sub-resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    client_id: String,
    limit_key: String,
}

impl LimitKey {
    pub fn new(client_id: impl Into<String>, limit_key: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            limit_key: limit_key.into(),
        }
    }

    pub fn global(client_id: impl Into<String>) -> Self {
        Self::new(client_id, GLOBAL_LIMIT_KEY)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn limit_key(&self) -> &str {
        &self.limit_key
    }

    /// Store key under an algorithm namespace, e.g. `ratelimit:token_bucket:acme:login`.
    pub fn store_key(&self, namespace: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            PREFIX,
            namespace,
            KeyGenerator::sanitize_key(&self.client_id),
            KeyGenerator::sanitize_key(&self.limit_key)
        )
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.limit_key)
    }
}

pub struct KeyGenerator;

impl KeyGenerator {
    /// Percent-encode every byte outside `[A-Za-z0-9_.@-]`, `%` included.
    ///
    /// The mapping is injective, so distinct ids always get distinct store
    /// keys, and the output never contains a `:` separator or glob characters.
    pub fn sanitize_key(key: &str) -> String {
        let mut escaped = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'@') {
                escaped.push(char::from(byte));
            } else {
                // Writes to a String never fail.
                let _ = write!(escaped, "%{:02X}", byte);
            }
        }
        escaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_key_layout() {
        let key = LimitKey::new("client_a", "login");
        assert_eq!(key.store_key("token_bucket"), "ratelimit:token_bucket:client_a:login");
    }

    #[test]
    fn test_global_default() {
        let key = LimitKey::global("client_b");
        assert_eq!(key.limit_key(), "global");
        assert_eq!(key.to_string(), "client_b/global");
    }

    #[test]
    fn test_sanitize_key() {
        let sanitized = KeyGenerator::sanitize_key("test@key#with$special:chars*");
        assert_eq!(sanitized, "test@key%23with%24special%3Achars%2A");
        assert_eq!(KeyGenerator::sanitize_key("plain_id-1.x"), "plain_id-1.x");
        assert_eq!(KeyGenerator::sanitize_key("100%"), "100%25");
        assert_eq!(KeyGenerator::sanitize_key("é"), "%C3%A9");
    }

    #[test]
    fn test_distinct_ids_get_distinct_store_keys() {
        let keys: Vec<String> = ["a:b", "a#b", "a_b", "a%3Ab", "a b"]
            .iter()
            .map(|id| LimitKey::global(*id).store_key("token_bucket"))
            .collect();
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(keys[0], "ratelimit:token_bucket:a%3Ab:global");
    }

    #[test]
    fn test_separator_cannot_collide() {
        let a = LimitKey::new("a:b", "c");
        let b = LimitKey::new("a", "b:c");
        assert_ne!(a.store_key("fixed_window"), b.store_key("fixed_window"));
    }
}
