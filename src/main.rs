//! doh-autoproxy: geo-aware DNS forwarder
//!
//! This is the main entry point for the daemon.
//!
//! # Usage
//!
//! ```bash
//! # Run with ./config.json
//! ./doh-autoproxy
//!
//! # Run with a custom configuration
//! ./doh-autoproxy -c /etc/doh-autoproxy/config.json
//!
//! # Run with environment overrides
//! DOH_AUTOPROXY_LOG_LEVEL=debug ./doh-autoproxy
//! ```

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use doh_autoproxy::app::App;
use doh_autoproxy::config::{load_config_with_env, resolve_config_path, Config};

/// Command-line arguments
struct Args {
    /// Configuration file path (`None` falls back to env, then default)
    config_path: Option<PathBuf>,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = None;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = Some(PathBuf::from(path));
                    }
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("doh-autoproxy v{}", doh_autoproxy::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"doh-autoproxy v{}

DNS forwarder that routes each query to an upstream group by name and
answer geography. Serves plain DNS, DoT, DoQ and DoH.

USAGE:
    doh-autoproxy [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: config.json]
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    DOH_AUTOPROXY_CONFIG       Configuration file path when -c is not given
    DOH_AUTOPROXY_LOG_LEVEL    Override log level (trace, debug, info, warn, error)
    DOH_AUTOPROXY_LOG_FORMAT   Override log format (text, json)
    RUST_LOG                   Per-module filter directives
"#,
        doh_autoproxy::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "rustls=warn", "quinn=warn", "h2=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if config.log.is_json() {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();
    let config_path = resolve_config_path(args.config_path.as_deref());

    let config = load_config_with_env(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("doh-autoproxy v{}", doh_autoproxy::VERSION);
    info!(path = %config_path.display(), "Configuration loaded");

    doh_autoproxy::cert::install_default_provider();

    let app = App::build(config).await.context("Startup failed")?;
    let running = app.start().await.context("Startup failed")?;

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for SIGINT");
            }
            info!("Received SIGINT");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM");
        }
    }

    if !running.shutdown().await {
        warn!("Some connections were cut off at the end of the grace period");
    }
    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
