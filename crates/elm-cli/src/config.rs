//! elmctl configuration, loaded from TOML.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use elm_obd::{PollerConfig, SessionConfig, VendorPid};
use serde::Deserialize;

/// Top-level configuration. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    /// Manufacturer PIDs added to the standard catalog.
    #[serde(default)]
    pub vendor_pids: Vec<VendorPid>,
    /// Trouble-code metadata table replacing the packaged one.
    #[serde(default)]
    pub dtc_table: Option<PathBuf>,
}

/// Network address of a Wi-Fi ELM327 adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "192.168.0.10".to_string()
}

fn default_port() -> u16 {
    35000
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl AdapterConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl CliConfig {
    /// Load config from a TOML file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elm_protocol::ObdProtocol;

    #[test]
    fn empty_file_uses_defaults() {
        let config: CliConfig = toml::from_str("").unwrap();
        assert_eq!(config.adapter.address(), "192.168.0.10:35000");
        assert_eq!(config.session, SessionConfig::default());
        assert_eq!(config.poller, PollerConfig::default());
        assert!(config.vendor_pids.is_empty());
        assert!(config.dtc_table.is_none());
    }

    #[test]
    fn full_config() {
        let toml = r#"
dtc_table = "/etc/elmctl/dtc.json"

[adapter]
host = "10.0.0.5"

[session]
protocol = "6"
command_timeout_ms = 2000

[poller]
base_interval_ms = 250
commands = ["010C", "221234"]

[[vendor_pids]]
name = "Oil life"
did = 0x1234
unit = "percent"
"#;
        let config: CliConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.adapter.address(), "10.0.0.5:35000");
        assert_eq!(config.session.protocol, ObdProtocol::Iso15765_4Can11bit500);
        assert_eq!(config.session.command_timeout_ms, 2000);
        assert_eq!(config.poller.commands.len(), 2);
        assert_eq!(config.vendor_pids[0].did, 0x1234);
        assert_eq!(config.dtc_table.as_deref(), Some(Path::new("/etc/elmctl/dtc.json")));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = CliConfig::from_file(Path::new("/nonexistent/elmctl.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/elmctl.toml"));
    }
}
