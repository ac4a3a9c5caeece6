use crate::circuit_breaker::BreakerConfig;
use crate::config::Config;
use crate::error::ThrottlerError;
use crate::rate_limit_config::RuleSet;
use std::net::SocketAddr;

/// Validates configuration objects for consistency and correctness.
///
/// Every failure here is fatal at startup; nothing is re-checked per request.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), ThrottlerError> {
        if url.is_empty() {
            return Err(ThrottlerError::ConfigurationError(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(ThrottlerError::ConfigurationError(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a bind address
    pub fn validate_bind_address(address: &str) -> Result<SocketAddr, ThrottlerError> {
        if address.is_empty() {
            return Err(ThrottlerError::ConfigurationError(
                "Bind address cannot be empty".to_string(),
            ));
        }

        address.parse().map_err(|_| {
            ThrottlerError::ConfigurationError(format!(
                "Bind address '{}' must be in ip:port format",
                address
            ))
        })
    }

    pub fn validate_breaker(config: &BreakerConfig) -> Result<(), ThrottlerError> {
        config.validate()
    }

    pub fn validate_rules(rules: &RuleSet) -> Result<(), ThrottlerError> {
        rules.validate()
    }

    /// Validates everything the process needs before it starts serving.
    pub fn validate_config(config: &Config) -> Result<(), ThrottlerError> {
        Self::validate_bind_address(&config.bind_addr)?;
        if !config.memory_store {
            Self::validate_redis_url(&config.redis_url)?;
        }
        config.algorithm_kind()?;
        let settings = config.throttler_settings()?;
        if settings.store_timeout.is_zero() {
            return Err(ThrottlerError::ConfigurationError(
                "Store timeout must be greater than 0".to_string(),
            ));
        }
        Self::validate_breaker(&config.breaker_config())?;
        Ok(())
    }
}
