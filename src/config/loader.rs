//! Configuration loading
//!
//! Loads configuration from JSON files, with optional environment overrides.

use std::path::Path;

use tracing::{debug, info};

use super::types::BridgeConfig;
use crate::error::ConfigError;

/// Override for `log.level`
pub const ENV_LOG_LEVEL: &str = "TUN_BRIDGE_LOG_LEVEL";

/// Override for `tun.dns`
pub const ENV_DNS: &str = "TUN_BRIDGE_DNS";

/// Override for `udp_workers`
pub const ENV_UDP_WORKERS: &str = "TUN_BRIDGE_UDP_WORKERS";

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<BridgeConfig, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: BridgeConfig = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        gateway = %config.tun.gateway,
        portal = %config.tun.portal,
        dns = %config.tun.dns,
        udp_workers = config.udp_workers,
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<BridgeConfig, ConfigError> {
    let config: BridgeConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TUN_BRIDGE_LOG_LEVEL`: override log level
/// - `TUN_BRIDGE_DNS`: override the hijacked resolver address
/// - `TUN_BRIDGE_UDP_WORKERS`: override the UDP worker count
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or validation fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<BridgeConfig, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Apply overrides from `lookup`, then re-validate
pub(crate) fn apply_env_overrides<F>(config: &mut BridgeConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(dns) = lookup(ENV_DNS) {
        dns.trim()
            .parse::<std::net::Ipv4Addr>()
            .map_err(|_| ConfigError::EnvError {
                name: ENV_DNS.into(),
                reason: format!("Invalid IPv4 address: {dns}"),
            })?;
        config.tun.dns = dns;
        debug!("DNS address overridden to {}", config.tun.dns);
    }

    if let Some(workers) = lookup(ENV_UDP_WORKERS) {
        config.udp_workers = workers.trim().parse().map_err(|_| ConfigError::EnvError {
            name: ENV_UDP_WORKERS.into(),
            reason: format!("Invalid number: {workers}"),
        })?;
        debug!("UDP workers overridden to {}", config.udp_workers);
    }

    config.validate()
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = BridgeConfig::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
