use clap::Parser;
use tracing::info;

use nexis_web::config::ConsoleArgs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ConsoleArgs::parse().into_config()?;

    info!(
        "Starting Nexis console on http://{} (cloud: {})",
        config.addr, config.cloud_api_url
    );

    nexis_web::server::serve(config).await
}
