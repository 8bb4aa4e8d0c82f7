use serde::{Deserialize, Serialize};

/// Which role this process is playing. `Debug` runs both in one process —
/// the Controller and the Agent share the binary but keep separate
/// filesystem roots, suffixed so the Agent's downloads and the Controller's
/// downloads never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    Controller,
    Agent,
    Debug,
}

/// Immutable per-Agent configuration snapshot, as loaded (and atomically
/// replaceable) on the Controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub secret: String,
    #[serde(default)]
    pub allowed_cidrs: Vec<String>,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("agent name must not be empty".into());
        }
        let len = self.secret.len();
        if !(16..=255).contains(&len) {
            return Err(format!(
                "agent '{}' secret must be 16-255 bytes, got {len}",
                self.name
            ));
        }
        for cidr in &self.allowed_cidrs {
            if cidr.parse::<ipnet::IpNet>().is_err() {
                return Err(format!("agent '{}' has malformed CIDR '{}'", self.name, cidr));
            }
        }
        Ok(())
    }
}

/// The three token purposes named in the wire contract (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPurpose {
    ShareUpload,
    FileUpload,
    FileDownload,
}

impl TokenPurpose {
    /// `FileUpload`/`ShareUpload` tokens are consumed on first successful
    /// validation; `FileDownload` tokens may be validated repeatedly (the
    /// Agent retries a failed HTTP pull) until they expire.
    pub fn is_single_use(self) -> bool {
        !matches!(self, TokenPurpose::FileDownload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_secret() {
        let cfg = AgentConfig {
            name: "a1".into(),
            secret: "short".into(),
            allowed_cidrs: vec![],
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_valid_config() {
        let cfg = AgentConfig {
            name: "a1".into(),
            secret: "0123456789abcdef".into(),
            allowed_cidrs: vec!["10.0.0.0/8".into()],
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn file_download_is_multi_use() {
        assert!(!TokenPurpose::FileDownload.is_single_use());
        assert!(TokenPurpose::FileUpload.is_single_use());
        assert!(TokenPurpose::ShareUpload.is_single_use());
    }
}
