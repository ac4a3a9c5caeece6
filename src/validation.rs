use crate::error::ThrottlerError;
use crate::key_generator::GLOBAL_LIMIT_KEY;
use regex::Regex;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::LazyLock;
use validator::{Validate, ValidationErrors};

/// Characters a client id or limit key may carry into a store key.
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.@-]+$").expect("identifier pattern compiles"));

fn default_limit_key() -> String {
    GLOBAL_LIMIT_KEY.to_string()
}

fn default_cost() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CheckLimitRequest {
    #[validate(length(min = 1, max = 128), regex(path = *IDENTIFIER))]
    pub client_id: String,

    #[serde(default = "default_limit_key")]
    #[validate(length(min = 1, max = 128), regex(path = *IDENTIFIER))]
    pub limit_key: String,

    #[serde(default = "default_cost")]
    #[validate(range(min = 1))]
    pub cost: u32,
}

impl CheckLimitRequest {
    pub fn cost(&self) -> Result<NonZeroU32, ThrottlerError> {
        NonZeroU32::new(self.cost).ok_or_else(|| {
            ThrottlerError::ValidationError("cost must be at least 1".to_string())
        })
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateRuleRequest {
    #[validate(length(min = 1, max = 128), regex(path = *IDENTIFIER))]
    pub client_id: String,

    #[validate(range(min = 1))]
    pub rate: u32,

    #[validate(range(min = 1))]
    pub window: u32,

    #[serde(default)]
    #[validate(length(min = 1, max = 128), regex(path = *IDENTIFIER))]
    pub endpoint: Option<String>,
}

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Run derived validation, flattening failures into one message.
    pub fn validate<T: Validate>(request: &T) -> Result<(), ThrottlerError> {
        request
            .validate()
            .map_err(|errors| ThrottlerError::ValidationError(Self::describe(&errors)))
    }

    fn describe(errors: &ValidationErrors) -> String {
        let mut fields: Vec<_> = errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| {
                let codes: Vec<_> = errs.iter().map(|e| e.code.to_string()).collect();
                format!("{}: {}", field, codes.join(", "))
            })
            .collect();
        fields.sort();
        format!("invalid request ({})", fields.join("; "))
    }
}
