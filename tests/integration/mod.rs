//! Integration tests for doh-autoproxy
//!
//! Every test starts the daemon through `App` on loopback addresses, with
//! fake UDP upstreams and geo databases generated on the fly.
//!
//! # Test Organization
//!
//! - `routing`: override, rule order and post-resolution re-routing
//! - `transports`: UDP/TCP/DoT/DoQ/DoH equivalence and certificate fallback
//! - `geo_provisioning`: downloading missing or empty databases
//!
//! # Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test --test integration_tests
//!
//! # Run specific test module
//! cargo test --test integration_tests transports
//! ```

pub mod support;

mod geo_provisioning;
mod routing;
mod transports;
