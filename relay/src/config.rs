//! Reads just enough of the config file to decide which role(s) to run
//! (§3 `RelayMode`) before handing the full file off to
//! `relay_server::config::ControllerConfig` and/or
//! `relay_agent::config::AgentConfig`, which own the rest of the schema.

use serde::Deserialize;

use relay_common::RelayMode;

#[derive(Debug, Deserialize)]
struct ModeProbe {
    relay: ModeSection,
}

#[derive(Debug, Deserialize)]
struct ModeSection {
    #[serde(default = "default_mode")]
    mode: RelayMode,
}

fn default_mode() -> RelayMode {
    RelayMode::Controller
}

pub fn probe_mode(raw: &str) -> anyhow::Result<RelayMode> {
    let probe: ModeProbe = toml::from_str(raw)?;
    Ok(probe.relay.mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_controller_when_mode_absent() {
        let mode = probe_mode("[relay]\nenabled = true\n").unwrap();
        assert_eq!(mode, RelayMode::Controller);
    }

    #[test]
    fn reads_debug_mode() {
        let mode = probe_mode("[relay]\nmode = \"debug\"\n").unwrap();
        assert_eq!(mode, RelayMode::Debug);
    }
}
