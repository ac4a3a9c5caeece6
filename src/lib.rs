pub mod algorithms;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod metrics;
pub mod middleware;
pub mod rate_limit_config;
pub mod response;
pub mod server;
pub mod store;
pub mod throttler;
pub mod validation;

pub use config::Config;
pub use error::{StoreError, ThrottlerError, ThrottlerResult};
pub use server::create_app;
pub use throttler::{Decision, FailMode, Throttler};
