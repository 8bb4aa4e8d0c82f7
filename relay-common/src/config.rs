//! §9 Design Note: "reimplement [reflection-heavy options loading] as an
//! explicit table of `{key, env-name, cli-short, cli-long, type, default,
//! description, flags}`". `OptionSpec` is that table's row type, kept as
//! plain data — each binary's `main.rs` builds a `&[OptionSpec]` describing
//! its own config keys and consumes it uniformly across the TOML file,
//! environment overrides, and a `--help` dump, instead of deriving any of
//! that from the config struct via reflection.

/// A single configuration key as it appears across all three sources
/// (TOML file, environment, CLI).
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub key: &'static str,
    pub env_name: &'static str,
    pub cli_long: &'static str,
    pub value_type: OptionType,
    pub default: Option<&'static str>,
    pub description: &'static str,
    pub requires_restart: bool,
    pub secret: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    Bool,
    String,
    U16,
    U64,
}

/// The Relay-specific keys common to both Controller and Agent configuration
/// (§6 "Configuration"). Each binary's own schema extends this with its
/// role-specific keys (`relay.agents[...]` on the Controller,
/// `relay.controller` on the Agent).
pub const SHARED_SCHEMA: &[OptionSpec] = &[
    OptionSpec {
        key: "relay.enabled",
        env_name: "RELAY_ENABLED",
        cli_long: "--relay-enabled",
        value_type: OptionType::Bool,
        default: Some("false"),
        description: "Enable the Relay subsystem",
        requires_restart: true,
        secret: false,
    },
    OptionSpec {
        key: "relay.mode",
        env_name: "RELAY_MODE",
        cli_long: "--relay-mode",
        value_type: OptionType::String,
        default: None,
        description: "controller | agent | debug",
        requires_restart: true,
        secret: false,
    },
    OptionSpec {
        key: "instance_name",
        env_name: "RELAY_INSTANCE_NAME",
        cli_long: "--instance-name",
        value_type: OptionType::String,
        default: None,
        description: "This daemon's Agent name, must match the Controller's configured entry",
        requires_restart: true,
        secret: false,
    },
];

/// Render a schema as a `--help`-style listing, grouping secrets' defaults
/// away from view.
pub fn describe(schema: &[OptionSpec]) -> String {
    let mut out = String::new();
    for spec in schema {
        let default = if spec.secret {
            "<redacted>".to_string()
        } else {
            spec.default.unwrap_or("<none>").to_string()
        };
        out.push_str(&format!(
            "{:<28} {:<24} {:<20} default={}  restart={}  -- {}\n",
            spec.key, spec.env_name, spec.cli_long, default, spec.requires_restart, spec.description
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_redacts_secret_defaults() {
        let schema = &[OptionSpec {
            key: "relay.agents.a1.secret",
            env_name: "RELAY_AGENT_A1_SECRET",
            cli_long: "--agent-a1-secret",
            value_type: OptionType::String,
            default: Some("not-actually-secret"),
            description: "Shared secret for agent a1",
            requires_restart: true,
            secret: true,
        }];
        let rendered = describe(schema);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("not-actually-secret"));
    }

    #[test]
    fn shared_schema_has_mode_key() {
        assert!(SHARED_SCHEMA.iter().any(|s| s.key == "relay.mode"));
    }
}
