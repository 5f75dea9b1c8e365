use etoad_service::config::ServiceConfig;
use etoad_service::server;

use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    // Optional config file as the only argument
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ServiceConfig::load(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    server::serve(&config).await?;
    Ok(())
}
