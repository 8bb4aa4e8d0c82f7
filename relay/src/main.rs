mod config;

use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_common::RelayMode;

const DEFAULT_CONFIG_PATH: &str = "/etc/relay/relay.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().nth(1).as_deref() == Some("--help") {
        print!("{}", relay_common::config::describe(relay_common::config::SHARED_SCHEMA));
        return Ok(());
    }

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let config_path = PathBuf::from(
        std::env::var("RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    let raw = std::fs::read_to_string(&config_path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", config_path.display(), e))?;
    let mode = config::probe_mode(&raw)?;

    match mode {
        RelayMode::Controller => {
            info!("relay starting in controller mode");
            let config = relay_server::config::ControllerConfig::load(&config_path)?;
            relay_server::serve(config).await
        }
        RelayMode::Agent => {
            info!("relay starting in agent mode");
            let config = relay_agent::config::AgentConfig::load(&config_path)?;
            relay_agent::run(config).await
        }
        RelayMode::Debug => run_debug(&config_path).await,
    }
}

/// Both roles in one process, sharing nothing but the filesystem — and even
/// that only after suffixing the Agent's download directory, since the
/// Controller and Agent would otherwise collide on the same default path
/// (§3 `RelayMode`: "destination paths are suffixed to avoid self-collision").
async fn run_debug(config_path: &std::path::Path) -> anyhow::Result<()> {
    info!("relay starting in debug mode (controller + agent in one process)");

    let controller_config = relay_server::config::ControllerConfig::load(config_path)?;

    let mut agent_config = relay_agent::config::AgentConfig::load(config_path)?;
    agent_config.relay.controller.downloads = agent_config.relay.controller.downloads.join("debug-agent");

    let controller_task = tokio::spawn(relay_server::serve(controller_config));
    let agent_client = relay_agent::client::RelayClient::new(agent_config)?;
    agent_client.start();

    info!("Running. Press Ctrl+C to stop.");
    tokio::select! {
        result = controller_task => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            agent_client.stop();
        }
    }

    Ok(())
}
