//! Shared application state for the Controller's `axum` router, following
//! `mosaicfs-server/src/state.rs`'s plain `Arc<AppState>` shape.

use std::path::PathBuf;
use std::sync::Arc;

use relay_common::RelayMode;

use crate::agent_registry::AgentRegistry;
use crate::relay_service::RelayService;
use crate::token_registry::TokenRegistry;

pub struct AppState {
    pub mode: RelayMode,
    pub api_key: String,
    pub agents: Arc<AgentRegistry>,
    pub tokens: Arc<TokenRegistry>,
    pub service: Arc<RelayService>,
    /// Scratch directory uploaded share-catalog databases are written into
    /// (§4.5.1, `share_<sanitizedAgent>_<random>.db`).
    pub share_temp_dir: PathBuf,
}

impl AppState {
    pub fn new(
        mode: RelayMode,
        api_key: String,
        agents: Arc<AgentRegistry>,
        tokens: Arc<TokenRegistry>,
        service: Arc<RelayService>,
        share_temp_dir: PathBuf,
    ) -> Self {
        Self {
            mode,
            api_key,
            agents,
            tokens,
            service,
            share_temp_dir,
        }
    }
}

pub type SharedState = Arc<AppState>;
