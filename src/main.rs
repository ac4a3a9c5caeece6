use anyhow::Result;
use clap::Parser;
use limiter::config::{Cli, Config};
use limiter::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?
        .with_overrides(Cli::parse());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("limiter={},tower_http=debug", config.log_level.to_lowercase()).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(service = %config.service_name, "Starting rate limiter");
    tracing::info!(
        "Configuration: bind_addr={}, store={}, algorithm={}, fail_mode={}",
        config.bind_addr,
        config.store_description(),
        config.algorithm,
        config.fail_mode
    );

    let server = Server::new(config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
