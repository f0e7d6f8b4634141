//! Configuration module for doh-autoproxy
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use doh_autoproxy::config::{load_config, resolve_config_path};
//!
//! let config = load_config(resolve_config_path(None)).unwrap();
//! println!("Default policy: {}", config.default_policy);
//! ```

mod loader;
mod types;

pub use loader::{
    load_config, load_config_str, load_config_with_env, resolve_config_path, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH,
    LOG_FORMAT_ENV, LOG_LEVEL_ENV,
};
pub use types::{
    parse_listen_addr, AutoCertConfig, Config, GeoDataConfig, ListenConfig, LogConfig, ServerConfig, TlsConfig,
    LETS_ENCRYPT_DIRECTORY,
};
