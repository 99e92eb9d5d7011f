//! Configuration loader (spec §6, §4.8, C8). Grounded on
//! `gamecore::config::GameConfig`: a `#[derive(Deserialize)]` struct tree
//! with a hand-written `Default` impl, loaded from a file the CLI points at.

use led_core::error::ConfigError;
use led_wire::{DEFAULT_MULTICAST_GROUP, DEFAULT_PORT};
use serde_derive::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub output: OutputSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientSection {
    pub port: u16,
    pub listen: Ipv4Addr,
    pub advertise_address: Option<Ipv4Addr>,
    pub multicast_group: Ipv4Addr,
    pub announcement_interval_initial: u64,
    pub announcement_interval: u64,
}

impl Default for ClientSection {
    fn default() -> ClientSection {
        ClientSection {
            port: DEFAULT_PORT,
            listen: Ipv4Addr::UNSPECIFIED,
            advertise_address: None,
            multicast_group: DEFAULT_MULTICAST_GROUP,
            announcement_interval_initial: 1,
            announcement_interval: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub fbsize: u32,
    pub channels: u16,
}

impl Default for OutputSection {
    fn default() -> OutputSection {
        OutputSection {
            fbsize: 4096,
            channels: 4,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig {
            client: ClientSection::default(),
            output: OutputSection::default(),
        }
    }
}

impl NodeConfig {
    /// Parses the TOML file at `path`. Missing optional keys fall back to
    /// [`ClientSection`]/[`OutputSection`] defaults; a malformed or unreadable
    /// file is a fatal [`ConfigError`] (spec §7, startup errors are fatal).
    pub fn load(path: &Path) -> Result<NodeConfig, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|_| ConfigError::MissingSection(path.display().to_string()))?;
        toml::from_str(&text).map_err(|err| ConfigError::BadAddress(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_schema() {
        let config = NodeConfig::default();
        assert_eq!(config.client.port, 7420);
        assert_eq!(config.client.multicast_group, Ipv4Addr::new(239, 42, 0, 69));
        assert_eq!(config.output.fbsize, 4096);
    }

    #[test]
    fn parses_partial_toml_with_fallback_defaults() {
        let toml_text = r#"
            [client]
            port = 9000

            [output]
            channels = 8
        "#;

        let config: NodeConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(config.client.port, 9000);
        assert_eq!(config.client.listen, Ipv4Addr::UNSPECIFIED);
        assert_eq!(config.output.channels, 8);
        assert_eq!(config.output.fbsize, 4096);
    }
}
