use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use duplicate_filter::config::Config;
use duplicate_filter::health::HealthRegistry;
use duplicate_filter::server::{router, serve, setup_metrics_recorder};
use duplicate_filter::service::DuplicateFilterService;

fn start_server(config: &Config, liveness: HealthRegistry) -> Result<JoinHandle<()>> {
    let metrics = setup_metrics_recorder()?;
    let router = router(liveness, metrics);
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Failed to serve metrics on {bind}: {e}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting duplicate filter service");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    info!("Configuration loaded: {:?}", config);

    let liveness = HealthRegistry::new("liveness");

    let server_handle = start_server(&config, liveness.clone())?;
    info!("Started metrics server on {}", config.bind_address());

    let service = DuplicateFilterService::new(config, liveness)?;

    let result = service.run().await;

    server_handle.abort();

    result
}
