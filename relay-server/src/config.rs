//! Controller-side configuration (§6 "Configuration (Controller)"), loaded
//! the way `mosaicfs-agent/src/config.rs` loads `AgentConfig::load`/`validate`:
//! a flat TOML file, parsed with `serde`, rejected up front by an explicit
//! `validate()` rather than failing lazily deep in request handlers.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use relay_common::AgentConfig as RelayAgentConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub relay: RelaySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub api_key: String,
    #[serde(default)]
    pub agents: Vec<RelayAgentConfig>,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_port: default_listen_port(),
            downloads_dir: default_downloads_dir(),
            data_dir: default_data_dir(),
            api_key: String::new(),
            agents: Vec::new(),
        }
    }
}

fn default_listen_port() -> u16 {
    9443
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("/var/lib/relay/downloads")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/relay/controller")
}

impl ControllerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        let config: ControllerConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.relay.enabled {
            return Ok(());
        }
        if self.relay.api_key.is_empty() {
            anyhow::bail!("relay.api_key must not be empty when relay.enabled = true");
        }
        if !self.relay.downloads_dir.is_absolute() {
            anyhow::bail!("relay.downloads_dir must be an absolute path");
        }
        if !self.relay.data_dir.is_absolute() {
            anyhow::bail!("relay.data_dir must be an absolute path");
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.relay.agents {
            agent.validate().map_err(|e| anyhow::anyhow!(e))?;
            if !seen.insert(agent.name.clone()) {
                anyhow::bail!("duplicate agent name '{}'", agent.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_relay_skips_validation() {
        let toml_str = r#"
[relay]
enabled = false
"#;
        let config: ControllerConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn enabled_relay_requires_api_key() {
        let toml_str = r#"
[relay]
enabled = true
downloads_dir = "/var/lib/relay/downloads"
data_dir = "/var/lib/relay/controller"
api_key = ""
"#;
        let config: ControllerConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_agent_names() {
        let toml_str = r#"
[relay]
enabled = true
api_key = "secret-api-key"
downloads_dir = "/var/lib/relay/downloads"
data_dir = "/var/lib/relay/controller"

[[relay.agents]]
name = "a1"
secret = "0123456789abcdef"

[[relay.agents]]
name = "a1"
secret = "fedcba9876543210"
"#;
        let config: ControllerConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_config() {
        let toml_str = r#"
[relay]
enabled = true
listen_port = 9443
api_key = "secret-api-key"
downloads_dir = "/var/lib/relay/downloads"
data_dir = "/var/lib/relay/controller"

[[relay.agents]]
name = "a1"
secret = "0123456789abcdef"
allowed_cidrs = ["10.0.0.0/8"]
"#;
        let config: ControllerConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.relay.agents.len(), 1);
    }
}
