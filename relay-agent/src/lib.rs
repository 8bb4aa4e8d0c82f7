pub mod client;
pub mod config;
pub mod http;
pub mod local_share;

use tracing::info;

use client::RelayClient;
use config::AgentConfig;

/// Runs the Agent role to completion (i.e. until ctrl_c). Shared between the
/// standalone `relay-agent` binary and the `relay` dispatch binary's Debug
/// mode, which runs this alongside `relay_server::serve` in the same process.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    if !config.relay.enabled {
        info!("relay.enabled = false, nothing to do");
        return Ok(());
    }

    for path in &config.relay.share_paths {
        if !path.exists() {
            anyhow::bail!("relay.share_paths entry does not exist: {}", path.display());
        }
    }
    tokio::fs::create_dir_all(&config.relay.controller.downloads).await?;

    let client = RelayClient::new(config)?;
    client.start();

    info!("Agent running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    client.stop();

    Ok(())
}
