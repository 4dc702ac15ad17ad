//! Configuration file parsing.
//!
//! TOML, one `[server]` table plus any number of `[[target]]` entries:
//!
//! ```toml
//! [server]
//! interfaces = ["eth0"]
//! control_socket = "/run/kvblade.sock"
//! log_level = "info"
//!
//! [[target]]
//! major = 1
//! minor = 0
//! interface = "eth0"
//! path = "/dev/loop0"
//! ```

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,

    /// Blades to export at startup
    #[serde(default)]
    pub target: Vec<TargetConfig>,
}

/// Server settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Interfaces to listen on
    pub interfaces: Vec<String>,

    /// Unix socket path for the management surface
    #[serde(default = "default_control_socket")]
    pub control_socket: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_control_socket() -> String {
    "/run/kvblade.sock".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One exported blade
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Shelf address (0-65534)
    pub major: u16,

    /// Slot address (0-254)
    pub minor: u8,

    /// Interface the blade answers on
    pub interface: String,

    /// Backing block device or file
    pub path: String,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.interfaces.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one interface is required".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for target in &self.target {
            let key = (target.major, target.minor, target.interface.as_str());
            if !seen.insert(key) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate target: {}.{}@{}",
                    target.major, target.minor, target.interface
                )));
            }

            if !self.server.interfaces.contains(&target.interface) {
                return Err(ConfigError::Invalid(format!(
                    "target {}.{} uses unlisted interface {}",
                    target.major, target.minor, target.interface
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config_str = r#"
[server]
interfaces = ["eth0"]

[[target]]
major = 1
minor = 0
interface = "eth0"
path = "/dev/loop0"
"#;

        let config = Config::parse(config_str).unwrap();
        assert_eq!(config.server.interfaces, vec!["eth0"]);
        assert_eq!(config.server.control_socket, "/run/kvblade.sock");
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.target.len(), 1);
        assert_eq!(config.target[0].major, 1);
        assert_eq!(config.target[0].path, "/dev/loop0");
    }

    #[test]
    fn duplicate_target_is_rejected() {
        let config_str = r#"
[server]
interfaces = ["eth0"]

[[target]]
major = 1
minor = 0
interface = "eth0"
path = "/dev/loop0"

[[target]]
major = 1
minor = 0
interface = "eth0"
path = "/dev/loop1"
"#;

        assert!(matches!(
            Config::parse(config_str),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn same_address_on_two_interfaces_is_fine() {
        let config_str = r#"
[server]
interfaces = ["eth0", "eth1"]

[[target]]
major = 1
minor = 0
interface = "eth0"
path = "/dev/loop0"

[[target]]
major = 1
minor = 0
interface = "eth1"
path = "/dev/loop0"
"#;

        let config = Config::parse(config_str).unwrap();
        assert_eq!(config.target.len(), 2);
    }

    #[test]
    fn unlisted_interface_is_rejected() {
        let config_str = r#"
[server]
interfaces = ["eth0"]

[[target]]
major = 1
minor = 0
interface = "eth7"
path = "/dev/loop0"
"#;

        assert!(matches!(
            Config::parse(config_str),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn no_interfaces_is_rejected() {
        let config_str = r#"
[server]
interfaces = []
"#;

        assert!(matches!(
            Config::parse(config_str),
            Err(ConfigError::Invalid(_))
        ));
    }
}
