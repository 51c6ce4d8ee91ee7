//! Service configuration loading and parsing.
//!
//! Precedence, lowest to highest: built-in defaults, TOML configuration
//! file, `MBCHAND_`-prefixed environment variables, command-line arguments.

use anyhow::{Context, Result};
use clap::Parser;
use config::Config as ConfigLoader;
use mbchan::{CmConfig, HDR_LEN, MAX_MSG_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Command-line interface for the service harness.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', default_value = "mbchand.toml")]
    pub config: String,

    /// Log level (overrides config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Number of loopback nodes (overrides config file)
    #[arg(long)]
    pub nodes: Option<u32>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print default configuration and exit
    #[arg(long)]
    pub print_default_config: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Loopback fabric shape for smoke runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Number of virtual nodes on the fabric.
    pub nodes: u32,

    /// Local port number each node exposes.
    pub port: u8,

    /// Destination ID of the first node; the rest count up from here.
    pub base_destid: u32,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            nodes: 2,
            port: 0,
            base_destid: 0x01,
        }
    }
}

/// Smoke traffic shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmokeConfig {
    /// Echo round trips per node pair.
    pub messages: u32,

    /// Payload bytes per message, header excluded.
    pub payload_len: usize,

    /// Channel number the listeners bind on every node.
    pub listen_channel: u16,
}

impl Default for SmokeConfig {
    fn default() -> Self {
        Self {
            messages: 8,
            payload_len: 64,
            listen_channel: 100,
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub logging: LoggingConfig,
    pub fabric: FabricConfig,
    pub core: CmConfig,
    pub smoke: SmokeConfig,
}

impl ServiceConfig {
    /// Validate the whole configuration tree.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.fabric.nodes < 2 {
            errors.push("fabric.nodes must be at least 2".to_string());
        }
        if self.smoke.messages == 0 {
            errors.push("smoke.messages must be at least 1".to_string());
        }
        if self.smoke.payload_len > MAX_MSG_SIZE - HDR_LEN {
            errors.push(format!(
                "smoke.payload_len must leave room for the header, max {}",
                MAX_MSG_SIZE - HDR_LEN
            ));
        }
        if self.smoke.listen_channel == 0 {
            errors.push("smoke.listen_channel must be non-zero".to_string());
        }
        if let Err(e) = self.core.validate() {
            errors.push(format!("core: {e}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load and parse the service configuration.
///
/// # Errors
///
/// Returns an error if the configuration file cannot be parsed or
/// validation fails.
pub fn load_config() -> Result<ServiceConfig> {
    let cli = CliArgs::parse();

    if cli.print_default_config {
        print_default_config()?;
        std::process::exit(0);
    }

    let mut config = load_config_file(&cli.config)?;
    apply_env_overrides(&mut config)?;
    apply_cli_overrides(&mut config, &cli);

    config.validate().map_err(|errors| {
        anyhow::anyhow!("configuration validation failed:\n{}", errors.join("\n"))
    })?;

    if cli.validate {
        println!("✓ Configuration is valid");
        std::process::exit(0);
    }

    Ok(config)
}

/// Load configuration from a TOML file, falling back to defaults when the
/// file does not exist.
fn load_config_file(path: &str) -> Result<ServiceConfig> {
    let path_obj = Path::new(path);

    if !path_obj.exists() {
        tracing::warn!(config_path = %path, "configuration file not found, using defaults");
        return Ok(ServiceConfig::default());
    }

    let config_str = std::fs::read_to_string(path_obj)
        .with_context(|| format!("failed to read config file: {path}"))?;

    toml::from_str(&config_str).with_context(|| format!("failed to parse TOML config: {path}"))
}

/// Apply environment variable overrides.
///
/// Variables are prefixed with `MBCHAND_` and use `__` as a separator, e.g.
/// `MBCHAND_LOGGING__LEVEL=debug` or `MBCHAND_FABRIC__NODES=4`.
fn apply_env_overrides(config: &mut ServiceConfig) -> Result<()> {
    let env_config = ConfigLoader::builder()
        .add_source(config::Environment::with_prefix("MBCHAND").separator("__"))
        .build()
        .context("failed to load environment variables")?;

    if let Ok(level) = env_config.get_string("logging.level") {
        config.logging.level = level;
    }
    if let Ok(nodes) = env_config.get_int("fabric.nodes") {
        config.fabric.nodes = nodes as u32;
    }
    if let Ok(messages) = env_config.get_int("smoke.messages") {
        config.smoke.messages = messages as u32;
    }

    Ok(())
}

/// Apply command-line argument overrides.
fn apply_cli_overrides(config: &mut ServiceConfig, cli: &CliArgs) {
    if let Some(ref level) = cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(nodes) = cli.nodes {
        config.fabric.nodes = nodes;
    }
}

/// Print the default configuration in TOML format.
fn print_default_config() -> Result<()> {
    let default_config = ServiceConfig::default();
    let toml_str =
        toml::to_string_pretty(&default_config).context("failed to serialize default config")?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(ServiceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_single_node_rejected() {
        let config = ServiceConfig {
            fabric: FabricConfig {
                nodes: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_payload_must_fit_datagram() {
        let config = ServiceConfig {
            smoke: SmokeConfig {
                payload_len: MAX_MSG_SIZE,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_str = toml::to_string_pretty(&ServiceConfig::default()).unwrap();
        let parsed: ServiceConfig = toml::from_str(&toml_str).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.fabric.nodes, 2);
        assert_eq!(parsed.core.mbox, 1);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: ServiceConfig = toml::from_str("[fabric]\nnodes = 4\n").unwrap();
        assert_eq!(parsed.fabric.nodes, 4);
        assert_eq!(parsed.smoke.messages, 8);
        assert_eq!(parsed.core.chan_start, 256);
    }
}
