//! Configuration loading
//!
//! The file is chosen from, in order: the `-c/--config` argument, the
//! `DOH_AUTOPROXY_CONFIG` environment variable, `config.json` in the
//! working directory.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "DOH_AUTOPROXY_CONFIG";

/// Environment variable overriding `log.level`
pub const LOG_LEVEL_ENV: &str = "DOH_AUTOPROXY_LOG_LEVEL";

/// Environment variable overriding `log.format`
pub const LOG_FORMAT_ENV: &str = "DOH_AUTOPROXY_LOG_FORMAT";

/// File used when neither the command line nor the environment names one
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Pick the configuration path
#[must_use]
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    resolve_config_path_with(cli, |name| std::env::var(name).ok())
}

fn resolve_config_path_with<F>(cli: Option<&Path>, env: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    env(CONFIG_PATH_ENV)
        .filter(|v| !v.trim().is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!(path = %path.display(), "Loading configuration");

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {}", path.display()))
    })?;

    config.validate()?;

    info!(
        path = %path.display(),
        groups = config.upstreams.len(),
        default_policy = %config.default_policy,
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration and apply environment overrides
///
/// Environment variables:
/// - `DOH_AUTOPROXY_LOG_LEVEL`: override `log.level`
/// - `DOH_AUTOPROXY_LOG_FORMAT`: override `log.format`
///
/// # Errors
///
/// Returns `ConfigError` if loading fails or an override is invalid.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let config = load_config(path)?;
    apply_env_overrides(config, |name| std::env::var(name).ok())
}

fn apply_env_overrides<F>(mut config: Config, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(level) = env(LOG_LEVEL_ENV) {
        if level.trim().is_empty() {
            return Err(ConfigError::EnvError {
                name: LOG_LEVEL_ENV.into(),
                reason: "empty value".into(),
            });
        }
        config.log.level = level;
        debug!(level = %config.log.level, "Log level overridden");
    }

    if let Some(format) = env(LOG_FORMAT_ENV) {
        config.log.format = format;
        debug!(format = %config.log.format, "Log format overridden");
    }

    // Re-validate after overrides
    config.validate().map_err(|e| match e {
        ConfigError::ValidationError(reason) => ConfigError::EnvError {
            name: LOG_FORMAT_ENV.into(),
            reason,
        },
        other => other,
    })?;

    Ok(config)
}
