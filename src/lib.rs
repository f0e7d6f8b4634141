//! doh-autoproxy: geo-aware DNS forwarder
//!
//! Answers DNS over UDP, TCP, DNS-over-TLS, DNS-over-QUIC and
//! DNS-over-HTTPS, and picks the upstream group for every query from the
//! name and, after resolution, from the region of the answer addresses.
//!
//! # Features
//!
//! - **Geo routing**: `geosite.dat` categories and `geoip.dat` regions,
//!   loaded selectively for the tags the rules mention
//! - **Two-pass decisions**: name rules before forwarding, address rules
//!   after the first answer arrives
//! - **Overrides**: hosts-style forced answers, blocks and NXDOMAIN
//! - **Encrypted transports**: DoT, DoQ and DoH front-ends sharing one
//!   query handler; UDP, TCP, DoT and DoH upstream clients
//! - **Certificates**: ACME HTTP-01 issuance and renewal with a static
//!   PEM fallback
//!
//! # Architecture
//!
//! ```text
//! Client → UDP/TCP/DoT/DoQ/DoH → DnsHandler → Router (pre) → Dispatcher → upstream group
//!                                                  ↑                          │
//!                                                  └──── Router (post) ◄──────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use doh_autoproxy::app::App;
//! use doh_autoproxy::config::load_config;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("config.json")?;
//! let running = App::build(config).await?.start().await?;
//!
//! // ... wait for a signal ...
//! running.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`app`]: Startup order and front-end lifecycle
//! - [`cert`]: Certificate issuance, renewal and the HTTP-01 responder
//! - [`config`]: Configuration types and loading
//! - [`dns`]: Upstream clients, dispatcher and front-ends
//! - [`error`]: Error types
//! - [`geo`]: `geoip.dat` / `geosite.dat` decoding and lookup
//! - [`rules`]: Override list, rule list and routing engine

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod app;
pub mod cert;
pub mod config;
pub mod dns;
pub mod error;
pub mod geo;
pub mod rules;

// Re-export commonly used types at the crate root
pub use app::{App, BoundAddrs, RunningApp};
pub use cert::{CertManager, CertStatus};
pub use config::{load_config, Config};
pub use dns::{DnsHandler, Dispatcher};
pub use error::{AutoproxyError, ConfigError, RuleError};
pub use geo::{GeoError, GeoStore};
pub use rules::{Decision, Policy, Router};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
