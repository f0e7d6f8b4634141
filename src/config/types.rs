//! Configuration types for doh-autoproxy
//!
//! The daemon reads one JSON document. Everything except `upstreams` has a
//! default, so a minimal file only names the upstream groups.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dns::server::{
    ServerOptions, DEFAULT_DOH_PATH, DEFAULT_MAX_TCP_CONNECTIONS, DEFAULT_SHUTDOWN_GRACE_SECS, DEFAULT_TCP_IDLE_TIMEOUT_SECS,
};
use crate::dns::{UpstreamConfig, DEFAULT_UPSTREAM_TIMEOUT_SECS};
use crate::error::ConfigError;
use crate::rules::Policy;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Front-end listen addresses
    #[serde(default)]
    pub listen: ListenConfig,

    /// Upstream groups, each tried in order
    pub upstreams: BTreeMap<String, Vec<UpstreamConfig>>,

    /// Policy when no override or rule matches
    #[serde(default = "default_policy")]
    pub default_policy: String,

    /// Override list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts_file: Option<PathBuf>,

    /// Rule list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_file: Option<PathBuf>,

    #[serde(default)]
    pub geo_data: GeoDataConfig,

    /// Static certificate
    #[serde(default)]
    pub tls: TlsConfig,

    /// Automated issuance
    #[serde(default)]
    pub auto_cert: AutoCertConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// Rule and hosts files are checked later, once the upstream groups are
    /// known to the routing engine.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen.validate()?;

        if self.upstreams.is_empty() {
            return Err(ConfigError::validation("At least one upstream group must be configured"));
        }
        for (name, upstreams) in &self.upstreams {
            if name.trim().is_empty() {
                return Err(ConfigError::validation("Upstream group names must not be empty"));
            }
            if Policy::parse(name).is_terminal() {
                return Err(ConfigError::validation(format!(
                    "Upstream group name '{name}' is reserved"
                )));
            }
            if upstreams.is_empty() {
                return Err(ConfigError::validation(format!(
                    "Upstream group '{name}' has no servers"
                )));
            }
            for upstream in upstreams {
                upstream.endpoint().map_err(|e| {
                    ConfigError::validation(format!("Upstream group '{name}': {e}"))
                })?;
            }
        }

        if let Some(group) = Policy::parse(&self.default_policy).group() {
            if !self.upstreams.contains_key(group) {
                return Err(ConfigError::validation(format!(
                    "Default policy '{group}' is not a configured upstream group"
                )));
            }
        }

        self.tls.validate()?;
        self.auto_cert.validate()?;
        self.server.validate()?;
        self.log.validate()?;

        Ok(())
    }

    /// Upstream groups with the server-wide query timeout applied to
    /// entries that do not set their own
    #[must_use]
    pub fn upstream_groups(&self) -> BTreeMap<String, Vec<UpstreamConfig>> {
        self.upstreams
            .iter()
            .map(|(name, list)| {
                let list = list
                    .iter()
                    .cloned()
                    .map(|u| u.with_default_timeout(self.server.query_timeout_secs))
                    .collect();
                (name.clone(), list)
            })
            .collect()
    }

    /// Whether any TLS front-end is configured
    #[must_use]
    pub fn wants_tls(&self) -> bool {
        !self.listen.dot.is_empty() || !self.listen.doq.is_empty() || !self.listen.doh.is_empty()
    }
}

fn default_policy() -> String {
    "default".into()
}

/// Front-end listen addresses; an empty string disables that front-end
///
/// Addresses may omit the host (`":53"`), meaning all IPv4 interfaces.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    #[serde(default = "default_dns_listen")]
    pub dns_udp: String,

    #[serde(default = "default_dns_listen")]
    pub dns_tcp: String,

    #[serde(default)]
    pub dot: String,

    #[serde(default)]
    pub doq: String,

    #[serde(default)]
    pub doh: String,

    /// HTTP path answered by the DoH front-end
    #[serde(default = "default_doh_path")]
    pub doh_path: String,
}

impl ListenConfig {
    /// Validate listen configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut any = false;
        for (field, value) in self.fields() {
            any |= parse_listen_addr(field, value)?.is_some();
        }
        if !any {
            return Err(ConfigError::validation("No front-end listen address is configured"));
        }
        if !self.doh.is_empty() && !self.doh_path.starts_with('/') {
            return Err(ConfigError::validation(format!(
                "listen.doh_path must start with '/': {}",
                self.doh_path
            )));
        }
        Ok(())
    }

    fn fields(&self) -> [(&'static str, &str); 5] {
        [
            ("listen.dns_udp", &self.dns_udp),
            ("listen.dns_tcp", &self.dns_tcp),
            ("listen.dot", &self.dot),
            ("listen.doq", &self.doq),
            ("listen.doh", &self.doh),
        ]
    }

    /// Parsed UDP address, `None` when disabled
    pub fn dns_udp_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        parse_listen_addr("listen.dns_udp", &self.dns_udp)
    }

    pub fn dns_tcp_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        parse_listen_addr("listen.dns_tcp", &self.dns_tcp)
    }

    pub fn dot_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        parse_listen_addr("listen.dot", &self.dot)
    }

    pub fn doq_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        parse_listen_addr("listen.doq", &self.doq)
    }

    pub fn doh_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        parse_listen_addr("listen.doh", &self.doh)
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            dns_udp: default_dns_listen(),
            dns_tcp: default_dns_listen(),
            dot: String::new(),
            doq: String::new(),
            doh: String::new(),
            doh_path: default_doh_path(),
        }
    }
}

fn default_dns_listen() -> String {
    ":53".into()
}

fn default_doh_path() -> String {
    DEFAULT_DOH_PATH.into()
}

/// Parse a listen address; empty means disabled, a bare `:port` binds all
/// IPv4 interfaces
///
/// # Errors
///
/// `ConfigError::ValidationError` naming `field` when the value is not an
/// address.
pub fn parse_listen_addr(field: &str, value: &str) -> Result<Option<SocketAddr>, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    let invalid = || ConfigError::validation(format!("{field}: invalid listen address '{value}'"));
    if let Some(port) = value.strip_prefix(':') {
        let port: u16 = port.parse().map_err(|_| invalid())?;
        return Ok(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)));
    }
    value.parse().map(Some).map_err(|_| invalid())
}

/// Geo database files and their download sources
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeoDataConfig {
    #[serde(default = "default_geoip_dat")]
    pub geoip_dat: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geoip_download_url: Option<String>,

    #[serde(default = "default_geosite_dat")]
    pub geosite_dat: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geosite_download_url: Option<String>,
}

impl Default for GeoDataConfig {
    fn default() -> Self {
        Self {
            geoip_dat: default_geoip_dat(),
            geoip_download_url: None,
            geosite_dat: default_geosite_dat(),
            geosite_download_url: None,
        }
    }
}

fn default_geoip_dat() -> PathBuf {
    PathBuf::from("geoip.dat")
}

fn default_geosite_dat() -> PathBuf {
    PathBuf::from("geosite.dat")
}

/// Static certificate used when automated issuance is off or fails
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsConfig {
    /// PEM certificate chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,

    /// PEM private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

impl TlsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(ConfigError::validation("tls.cert_file and tls.key_file must be set together"));
        }
        Ok(())
    }

    /// Both halves of the static pair, if configured
    #[must_use]
    pub fn pair(&self) -> Option<(&PathBuf, &PathBuf)> {
        self.cert_file.as_ref().zip(self.key_file.as_ref())
    }
}

/// Automated certificate issuance (ACME HTTP-01)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AutoCertConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Names on the certificate; the first one is the primary name
    #[serde(default)]
    pub domains: Vec<String>,

    /// Contact address for the ACME account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Issued certificates and account credentials
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_directory_url")]
    pub directory_url: String,

    /// Renew this many days before expiry
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,

    /// HTTP-01 responder and HTTPS redirector
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl AutoCertConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.domains.is_empty() {
            return Err(ConfigError::validation("auto_cert.domains must list at least one name"));
        }
        if let Some(bad) = self.domains.iter().find(|d| d.trim().is_empty() || d.contains(['/', ' ', ':'])) {
            return Err(ConfigError::validation(format!("auto_cert.domains: invalid name '{bad}'")));
        }
        if self.renew_before_days == 0 {
            return Err(ConfigError::validation("auto_cert.renew_before_days must be greater than 0"));
        }
        if !self.directory_url.starts_with("https://") {
            return Err(ConfigError::validation(format!(
                "auto_cert.directory_url must be an https URL: {}",
                self.directory_url
            )));
        }
        if parse_listen_addr("auto_cert.http_listen", &self.http_listen)?.is_none() {
            return Err(ConfigError::validation("auto_cert.http_listen is required for HTTP-01"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn renew_before(&self) -> Duration {
        Duration::from_secs(self.renew_before_days * 24 * 60 * 60)
    }

    pub fn http_listen_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        parse_listen_addr("auto_cert.http_listen", &self.http_listen)
    }
}

impl Default for AutoCertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            domains: Vec::new(),
            email: None,
            cache_dir: default_cache_dir(),
            directory_url: default_directory_url(),
            renew_before_days: default_renew_before_days(),
            http_listen: default_http_listen(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("certs")
}

fn default_directory_url() -> String {
    LETS_ENCRYPT_DIRECTORY.into()
}

const fn default_renew_before_days() -> u64 {
    30
}

fn default_http_listen() -> String {
    ":80".into()
}

/// Timeouts and limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Default per-upstream query timeout
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    /// Idle timeout for TCP, DoT, DoQ and DoH connections
    #[serde(default = "default_tcp_idle_timeout_secs")]
    pub tcp_idle_timeout_secs: u64,

    /// Concurrent connections per connection-oriented listener
    #[serde(default = "default_max_tcp_connections")]
    pub max_tcp_connections: usize,

    /// Time in-flight connections get to finish after a shutdown signal
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl ServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.query_timeout_secs == 0 {
            return Err(ConfigError::validation("server.query_timeout_secs must be greater than 0"));
        }
        if self.tcp_idle_timeout_secs == 0 {
            return Err(ConfigError::validation("server.tcp_idle_timeout_secs must be greater than 0"));
        }
        if self.max_tcp_connections == 0 {
            return Err(ConfigError::validation("server.max_tcp_connections must be greater than 0"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Listener tuning for the connection-oriented front-ends
    #[must_use]
    pub const fn server_options(&self) -> ServerOptions {
        ServerOptions {
            idle_timeout: Duration::from_secs(self.tcp_idle_timeout_secs),
            max_connections: self.max_tcp_connections,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: default_query_timeout_secs(),
            tcp_idle_timeout_secs: default_tcp_idle_timeout_secs(),
            max_tcp_connections: default_max_tcp_connections(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

const fn default_query_timeout_secs() -> u64 {
    DEFAULT_UPSTREAM_TIMEOUT_SECS
}

const fn default_tcp_idle_timeout_secs() -> u64 {
    DEFAULT_TCP_IDLE_TIMEOUT_SECS
}

const fn default_max_tcp_connections() -> usize {
    DEFAULT_MAX_TCP_CONNECTIONS
}

const fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl LogConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.format.as_str(), "json" | "text") {
            return Err(ConfigError::validation(format!(
                "log.format must be 'json' or 'text', got '{}'",
                self.format
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == "json"
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
