//! Configuration module
//!
//! Handles loading and saving AgentLink configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::protocol::{CodecKind, DEFAULT_PORT};
use crate::session::{AlwaysValid, DomainAllowlist, EngineOptions, LicensePolicy, Revoked};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// License settings
    #[serde(default)]
    pub license: LicenseConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Server name used in the legacy greeting
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "agentlink".to_string()),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Wire encoding
    #[serde(default)]
    pub codec: CodecKind,
    /// Greet new connections with `welcome`
    #[serde(default)]
    pub send_welcome: bool,
    /// Answer free-form messages with `echo`
    #[serde(default)]
    pub echo_messages: bool,
    /// Outbound queue size per session
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Time allowed for the WebSocket upgrade (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_channel_capacity() -> usize {
    64
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            codec: CodecKind::default(),
            send_welcome: false,
            echo_messages: false,
            channel_capacity: default_channel_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Which license policy to run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    /// Every session is licensed
    #[default]
    AlwaysValid,
    /// Sessions from listed domains are licensed
    DomainAllowlist,
    /// No session is licensed
    Revoked,
}

/// License configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseConfig {
    #[serde(default)]
    pub policy: PolicyKind,
    /// Key reported in every `license` message
    #[serde(default = "default_license_key")]
    pub key: String,
    /// Licensed domains for the allowlist policy
    #[serde(default)]
    pub domains: Vec<String>,
    /// Reason reported by the revoked policy
    #[serde(default = "default_revoked_reason")]
    pub reason: String,
}

fn default_license_key() -> String {
    "AGENTLINK-DEV".to_string()
}

fn default_revoked_reason() -> String {
    "license revoked".to_string()
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            key: default_license_key(),
            domains: Vec::new(),
            reason: default_revoked_reason(),
        }
    }
}

impl LicenseConfig {
    /// Build the configured policy
    pub fn build_policy(&self) -> Arc<dyn LicensePolicy> {
        match self.policy {
            PolicyKind::AlwaysValid => Arc::new(AlwaysValid::new(self.key.clone())),
            PolicyKind::DomainAllowlist => {
                Arc::new(DomainAllowlist::new(self.key.clone(), self.domains.clone()))
            }
            PolicyKind::Revoked => Arc::new(Revoked::new(self.key.clone(), self.reason.clone())),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("agentlink/config.toml")),
            Some(PathBuf::from("./agentlink.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Session engine options derived from this configuration
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            send_welcome: self.network.send_welcome,
            echo_messages: self.network.echo_messages,
            server_name: self.general.name.clone(),
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "agentlink-01".to_string(),
            verbose: false,
        },
        network: NetworkConfig {
            bind_address: Some("0.0.0.0".to_string()),
            ..Default::default()
        },
        license: LicenseConfig {
            policy: PolicyKind::DomainAllowlist,
            domains: vec!["example.com".to_string()],
            ..Default::default()
        },
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.network.codec, CodecKind::Json);
        assert_eq!(config.license.policy, PolicyKind::AlwaysValid);
        assert!(!config.network.send_welcome);
        assert!(!config.network.echo_messages);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.network.codec = CodecKind::Cbor;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, config.network.port);
        assert_eq!(loaded.network.codec, CodecKind::Cbor);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nport = 8080\ncodec = \"cbor\"\n\n[license]\npolicy = \"revoked\"").unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, 8080);
        assert_eq!(loaded.network.codec, CodecKind::Cbor);
        assert_eq!(loaded.network.channel_capacity, 64);
        assert_eq!(loaded.network.connect_timeout_ms, 5000);
        assert_eq!(loaded.license.policy, PolicyKind::Revoked);
        assert_eq!(loaded.license.key, "AGENTLINK-DEV");
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/agentlink.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "agentlink-01");
        assert_eq!(parsed.license.policy, PolicyKind::DomainAllowlist);
        assert_eq!(parsed.license.domains, vec!["example.com".to_string()]);
    }

    #[test]
    fn test_build_policy() {
        let mut license = LicenseConfig::default();
        assert_eq!(license.build_policy().name(), "always-valid");

        license.policy = PolicyKind::DomainAllowlist;
        assert_eq!(license.build_policy().name(), "domain-allowlist");

        license.policy = PolicyKind::Revoked;
        assert_eq!(license.build_policy().name(), "revoked");
    }

    #[test]
    fn test_engine_options() {
        let mut config = Config::default();
        config.general.name = "edge".to_string();
        config.network.echo_messages = true;

        let options = config.engine_options();
        assert!(options.echo_messages);
        assert!(!options.send_welcome);
        assert_eq!(options.server_name, "edge");
    }
}
