//! Agent-side configuration (§6 "Configuration (Agent)"), following the same
//! `load`/`validate` shape as `mosaicfs-agent/src/config.rs`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Must match the name the Controller has configured for this Agent.
    pub instance_name: String,
    #[serde(default)]
    pub relay: RelaySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default)]
    pub enabled: bool,
    pub controller: ControllerAddress,
    /// Local directories scanned to build the share catalog uploaded on
    /// connect. Out of scope to validate contents (§1 Non-goals leave the
    /// Share subsystem external); the Agent only needs to be able to read
    /// from them.
    #[serde(default)]
    pub share_paths: Vec<PathBuf>,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            enabled: false,
            controller: ControllerAddress {
                address: String::new(),
                ignore_certificate_errors: false,
                api_key: String::new(),
                secret: String::new(),
                downloads: default_downloads(),
            },
            share_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerAddress {
    /// e.g. `relay.example.com:9443`.
    pub address: String,
    /// Never defaults to `true` (§9 TLS note) — an operator must opt in.
    #[serde(default)]
    pub ignore_certificate_errors: bool,
    pub api_key: String,
    pub secret: String,
    #[serde(default = "default_downloads")]
    pub downloads: PathBuf,
}

fn default_downloads() -> PathBuf {
    PathBuf::from("/var/lib/relay/agent/downloads")
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        let config: AgentConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.relay.enabled {
            return Ok(());
        }
        if self.instance_name.is_empty() {
            anyhow::bail!("instance_name must not be empty when relay.enabled = true");
        }
        if self.relay.controller.address.is_empty() {
            anyhow::bail!("relay.controller.address must not be empty");
        }
        if self.relay.controller.api_key.is_empty() {
            anyhow::bail!("relay.controller.api_key must not be empty");
        }
        let secret_len = self.relay.controller.secret.len();
        if !(16..=255).contains(&secret_len) {
            anyhow::bail!("relay.controller.secret must be 16-255 bytes, got {secret_len}");
        }
        if !self.relay.controller.downloads.is_absolute() {
            anyhow::bail!("relay.controller.downloads must be an absolute path");
        }
        for p in &self.relay.share_paths {
            if !p.is_absolute() {
                anyhow::bail!("relay.share_paths entries must be absolute: {}", p.display());
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
instance_name = ""
[relay]
enabled = false
"#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn enabled_relay_requires_instance_name() {
        let toml_str = r#"
instance_name = ""
[relay]
enabled = true
[relay.controller]
address = "relay.example.com:9443"
api_key = "key"
secret = "0123456789abcdef"
"#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_short_secret() {
        let toml_str = r#"
instance_name = "a1"
[relay]
enabled = true
[relay.controller]
address = "relay.example.com:9443"
api_key = "key"
secret = "short"
"#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_config() {
        let toml_str = r#"
instance_name = "a1"
[relay]
enabled = true
share_paths = ["/home/user/Music"]
[relay.controller]
address = "relay.example.com:9443"
ignore_certificate_errors = true
api_key = "key"
secret = "0123456789abcdef"
downloads = "/var/lib/relay/agent/downloads"
"#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.relay.share_paths.len(), 1);
    }
}
