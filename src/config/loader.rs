//! Configuration loading
//!
//! JSON file loading with environment variable overrides, matching the
//! deployment story: a baked-in config plus `NETEM_ROUTER_*` tweaks.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    info!(tun_addr = %config.tun.address, "Configuration loaded");
    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `NETEM_ROUTER_LOG_LEVEL`: Override log level
/// - `NETEM_ROUTER_TUN_ADDR`: Override the tun address
/// - `NETEM_ROUTER_IDLE_TIMEOUT_SECS`: Override the session idle horizon
///
/// # Errors
///
/// Returns `ConfigError` if loading fails or an override is malformed.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(level) = std::env::var("NETEM_ROUTER_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Ok(addr) = std::env::var("NETEM_ROUTER_TUN_ADDR") {
        config.tun.address = addr.parse().map_err(|_| ConfigError::EnvError {
            name: "NETEM_ROUTER_TUN_ADDR".into(),
            reason: format!("Invalid IPv4 address: {addr}"),
        })?;
        debug!("Tun address overridden to {}", config.tun.address);
    }

    if let Ok(secs) = std::env::var("NETEM_ROUTER_IDLE_TIMEOUT_SECS") {
        config.router.idle_timeout_secs =
            secs.parse().map_err(|_| ConfigError::EnvError {
                name: "NETEM_ROUTER_IDLE_TIMEOUT_SECS".into(),
                reason: format!("Invalid number: {secs}"),
            })?;
        debug!(
            "Idle timeout overridden to {}s",
            config.router.idle_timeout_secs
        );
    }

    config.validate()?;
    Ok(config)
}

/// Render the default configuration as pretty JSON
#[must_use]
pub fn default_config_json() -> String {
    serde_json::to_string_pretty(&Config::default()).expect("default config serializes")
}
