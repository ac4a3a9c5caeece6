use crate::error::ThrottlerError;
use crate::key_generator::GLOBAL_LIMIT_KEY;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Individual rate limiting rule: `rate` units per `window` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub rate: u32,
    pub window: u32,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            rate: 100,
            window: 60,
        }
    }
}

impl RateLimitRule {
    pub fn new(rate: u32, window: u32) -> Self {
        Self { rate, window }
    }

    /// Validate rule parameters
    pub fn validate(&self) -> Result<(), ThrottlerError> {
        if self.rate == 0 {
            return Err(ThrottlerError::ConfigurationError(
                "Rate must be greater than 0".to_string(),
            ));
        }
        if self.window == 0 {
            return Err(ThrottlerError::ConfigurationError(
                "Window must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-client overrides. Missing fields fall back to the system default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<u32>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub endpoints: HashMap<String, RateLimitRule>,
}

/// Complete, immutable rule table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub default: RateLimitRule,
    #[serde(default)]
    pub clients: HashMap<String, ClientRules>,
}

impl RuleSet {
    /// Effective rule: exact `(client, limit_key)` override, then the
    /// client-level default, then the system default.
    pub fn resolve(&self, client_id: &str, limit_key: &str) -> RateLimitRule {
        let Some(client) = self.clients.get(client_id) else {
            return self.default;
        };
        if let Some(rule) = client.endpoints.get(limit_key) {
            return *rule;
        }
        RateLimitRule {
            rate: client.rate.unwrap_or(self.default.rate),
            window: client.window.unwrap_or(self.default.window),
        }
    }

    pub fn validate(&self) -> Result<(), ThrottlerError> {
        self.default
            .validate()
            .map_err(|e| ThrottlerError::ConfigurationError(format!("default rule: {}", e)))?;

        for (client_id, client) in &self.clients {
            let effective = RateLimitRule {
                rate: client.rate.unwrap_or(self.default.rate),
                window: client.window.unwrap_or(self.default.window),
            };
            effective.validate().map_err(|e| {
                ThrottlerError::ConfigurationError(format!("client '{}': {}", client_id, e))
            })?;
            for (endpoint, rule) in &client.endpoints {
                rule.validate().map_err(|e| {
                    ThrottlerError::ConfigurationError(format!(
                        "client '{}' endpoint '{}': {}",
                        client_id, endpoint, e
                    ))
                })?;
            }
        }
        Ok(())
    }

    pub fn from_json(raw: &str) -> Result<Self, ThrottlerError> {
        let rules: RuleSet = serde_json::from_str(raw)
            .map_err(|e| ThrottlerError::ConfigurationError(format!("Invalid rules file: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn load(path: &Path) -> Result<Self, ThrottlerError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ThrottlerError::ConfigurationError(format!(
                "Failed to read rules file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&raw)
    }
}

/// Shared handle to the current [`RuleSet`].
///
/// Readers take a snapshot without locking. Writers build a modified copy and
/// swap it in whole, so a reader sees either the old table or the new one.
#[derive(Debug, Clone)]
pub struct RuleBook {
    current: Arc<ArcSwap<RuleSet>>,
}

impl Default for RuleBook {
    fn default() -> Self {
        Self::new(RuleSet::default())
    }
}

impl RuleBook {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(rules)),
        }
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    pub fn resolve(&self, client_id: &str, limit_key: &str) -> RateLimitRule {
        self.current.load().resolve(client_id, limit_key)
    }

    pub fn replace(&self, rules: RuleSet) -> Result<(), ThrottlerError> {
        rules.validate()?;
        self.current.store(Arc::new(rules));
        Ok(())
    }

    /// Set the client-level rule, keeping the client's endpoint overrides.
    pub fn upsert_client(&self, client_id: &str, rule: RateLimitRule) -> Result<(), ThrottlerError> {
        rule.validate()?;
        self.current.rcu(|current| {
            let mut next = RuleSet::clone(current);
            let client = next.clients.entry(client_id.to_string()).or_default();
            client.rate = Some(rule.rate);
            client.window = Some(rule.window);
            next
        });
        info!(client_id, rate = rule.rate, window = rule.window, "Updated client rule");
        Ok(())
    }

    pub fn upsert_endpoint(
        &self,
        client_id: &str,
        limit_key: &str,
        rule: RateLimitRule,
    ) -> Result<(), ThrottlerError> {
        rule.validate()?;
        if limit_key == GLOBAL_LIMIT_KEY {
            return self.upsert_client(client_id, rule);
        }
        self.current.rcu(|current| {
            let mut next = RuleSet::clone(current);
            next.clients
                .entry(client_id.to_string())
                .or_default()
                .endpoints
                .insert(limit_key.to_string(), rule);
            next
        });
        info!(client_id, limit_key, rate = rule.rate, window = rule.window, "Updated endpoint rule");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RuleSet {
        RuleSet::from_json(
            r#"{
                "default": {"rate": 100, "window": 60},
                "clients": {
                    "client_a": {
                        "rate": 100, "window": 60,
                        "endpoints": {"login": {"rate": 20, "window": 60}}
                    },
                    "client_b": {"rate": 50},
                    "client_c": {"endpoints": {"register": {"rate": 10, "window": 30}}}
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_resolution_precedence() {
        let rules = sample();
        assert_eq!(rules.resolve("client_a", "login"), RateLimitRule::new(20, 60));
        assert_eq!(rules.resolve("client_a", "global"), RateLimitRule::new(100, 60));
        assert_eq!(rules.resolve("client_b", "login"), RateLimitRule::new(50, 60));
        assert_eq!(rules.resolve("client_c", "register"), RateLimitRule::new(10, 30));
        assert_eq!(rules.resolve("client_c", "global"), RateLimitRule::new(100, 60));
        assert_eq!(rules.resolve("stranger", "login"), RateLimitRule::default());
    }

    #[test]
    fn test_invalid_rules_rejected_at_load() {
        let err = RuleSet::from_json(r#"{"default": {"rate": 0, "window": 60}}"#).unwrap_err();
        assert!(matches!(err, ThrottlerError::ConfigurationError(_)));

        let err = RuleSet::from_json(
            r#"{"clients": {"x": {"endpoints": {"e": {"rate": 5, "window": 0}}}}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("endpoint 'e'"));

        assert!(RuleSet::from_json("not json").is_err());
    }

    #[test]
    fn test_upsert_replaces_snapshot_without_touching_old() {
        let book = RuleBook::new(sample());
        let before = book.snapshot();

        book.upsert_endpoint("client_b", "search", RateLimitRule::new(5, 10))
            .unwrap();
        book.upsert_client("client_a", RateLimitRule::new(300, 60)).unwrap();

        assert_eq!(before.resolve("client_b", "search"), RateLimitRule::new(50, 60));
        assert_eq!(book.resolve("client_b", "search"), RateLimitRule::new(5, 10));
        assert_eq!(book.resolve("client_a", "global"), RateLimitRule::new(300, 60));
        assert_eq!(book.resolve("client_a", "login"), RateLimitRule::new(20, 60));
    }

    #[test]
    fn test_upsert_global_endpoint_sets_client_rule() {
        let book = RuleBook::default();
        book.upsert_endpoint("client_d", GLOBAL_LIMIT_KEY, RateLimitRule::new(7, 7))
            .unwrap();
        assert_eq!(book.resolve("client_d", "anything"), RateLimitRule::new(7, 7));
    }

    #[test]
    fn test_upsert_rejects_invalid_rule() {
        let book = RuleBook::default();
        assert!(book.upsert_client("x", RateLimitRule::new(0, 60)).is_err());
        assert!(book.snapshot().clients.is_empty());
    }
}
