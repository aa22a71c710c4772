use myh2o_bridge::{BridgeCoordinator, Config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting MyH2O bridge");
    let config = Config::from_env()?;
    config.log_config();

    if config.ha_url.is_empty() {
        tracing::warn!("HA_URL is not set; readings will be scraped but not published");
    }

    let coordinator = BridgeCoordinator::start(&config);

    tokio::signal::ctrl_c().await?;
    coordinator.shutdown().await;

    Ok(())
}
