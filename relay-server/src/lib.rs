pub mod agent_registry;
pub mod config;
pub mod http;
pub mod hub;
pub mod relay_service;
pub mod state;
pub mod tls;
pub mod token_registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State as AxumState};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use agent_registry::AgentRegistry;
use config::ControllerConfig;
use hub::RelayHub;
use relay_service::RelayService;
use state::{AppState, SharedState};
use token_registry::TokenRegistry;

/// Runs the Controller role to completion (i.e. until the listener errors
/// out). Shared between the standalone `relay-server` binary and the
/// `relay` dispatch binary's Debug mode, which runs this alongside
/// `relay_agent::run` in the same process.
pub async fn serve(config: ControllerConfig) -> anyhow::Result<()> {
    if !config.relay.enabled {
        info!("relay.enabled = false, nothing to do");
        return Ok(());
    }

    std::fs::create_dir_all(&config.relay.data_dir)?;
    std::fs::create_dir_all(&config.relay.downloads_dir)?;
    let share_temp_dir = config.relay.data_dir.join("share_uploads");
    std::fs::create_dir_all(&share_temp_dir)?;

    let rustls_config = tls::ensure_tls_certs(&config.relay.data_dir)?;
    info!("relay TLS certificates ready");

    let agents = Arc::new(AgentRegistry::new());
    agents.replace_all(config.relay.agents.clone());

    let tokens = Arc::new(TokenRegistry::default());
    let service = Arc::new(RelayService::new(
        Arc::clone(&agents),
        Arc::clone(&tokens),
        config.relay.downloads_dir.clone(),
    ));
    let hub = Arc::new(RelayHub::new(Arc::clone(&agents), Arc::clone(&tokens), Arc::clone(&service)));

    let app_state: SharedState = Arc::new(AppState::new(
        relay_common::RelayMode::Controller,
        config.relay.api_key.clone(),
        Arc::clone(&agents),
        Arc::clone(&tokens),
        Arc::clone(&service),
        share_temp_dir,
    ));

    // §4.2 TokenRegistry::Expire — background sweep of stale records.
    {
        let tokens = Arc::clone(&tokens);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                tokens.expire();
            }
        });
        info!("token expiry sweep started");
    }

    let ws_router = Router::new().route("/ws", get(ws_handler)).with_state(hub);

    let app = Router::new()
        .merge(ws_router)
        .merge(http::router(Arc::clone(&app_state)))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.relay.listen_port));
    info!(port = config.relay.listen_port, "listening on https://0.0.0.0:{}", config.relay.listen_port);

    let tls_config = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(rustls_config));
    axum_server::bind_rustls(addr, tls_config)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    AxumState(hub): AxumState<Arc<RelayHub>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| hub.handle_socket(socket, addr.ip()))
}
