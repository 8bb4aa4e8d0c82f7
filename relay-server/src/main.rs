use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_server::config::ControllerConfig;

const DEFAULT_CONFIG_PATH: &str = "/etc/relay/controller.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    info!("relay-server starting");

    let config_path = PathBuf::from(
        std::env::var("RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    let config = ControllerConfig::load(&config_path)?;
    relay_server::serve(config).await
}
