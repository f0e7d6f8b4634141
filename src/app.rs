//! Daemon wiring
//!
//! [`App::build`] does everything that must succeed before a socket is
//! opened: geo provisioning, override/rule parsing, routing snapshot,
//! upstream groups. [`App::start`] binds plain DNS, loads or starts
//! issuing certificates, brings up the TLS front-ends when a certificate
//! exists and hands back a [`RunningApp`] whose [`RunningApp::shutdown`]
//! drains them.
//!
//! ```text
//! Config ──► geo files ──► GeoStore ─┐
//!        ──► hosts / rules ──────────┼─► RoutingSnapshot ──► Router ─┐
//!        ──► upstream groups ──► Dispatcher ─────────────────────────┼─► DnsHandler
//!                                                                    │
//!        ──► CertManager ◄── HTTP-01 responder                       │
//!                 │                                                  │
//!                 └──► DoT / DoQ / DoH    UDP / TCP ◄─────────────────┘
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::cert::{CertManager, ChallengeServer, ChallengeStore};
use crate::config::{Config, GeoDataConfig};
use crate::dns::server::{shutdown_requested, ConnectionTracker, ServerOptions};
use crate::dns::{
    DnsHandler, DnsResult, Dispatcher, DohServer, DoqServer, DotServer, TcpDnsServer, UdpDnsServer,
};
use crate::error::{AutoproxyError, ConfigError};
use crate::geo::{ensure_geo_file, GeoKind, GeoStore, GeoStoreLoader, Provision};
use crate::rules::{HostsTable, Policy, Router, RoutingSnapshotBuilder, RuleList};

/// Make sure both databases exist, then load the parts `rules` refers to
///
/// # Errors
///
/// `GeoError` when a file is missing without a download source, a download
/// fails, or a database is corrupt.
pub async fn load_geo(geo: &GeoDataConfig, rules: &RuleList) -> Result<GeoStore, AutoproxyError> {
    for (kind, path, url) in [
        (GeoKind::GeoIp, &geo.geoip_dat, geo.geoip_download_url.as_deref()),
        (GeoKind::GeoSite, &geo.geosite_dat, geo.geosite_download_url.as_deref()),
    ] {
        if let Provision::Downloaded(bytes) = ensure_geo_file(kind, path, url).await? {
            debug!(kind = %kind, bytes, "Database provisioned");
        }
    }

    let loader = GeoStoreLoader::new()
        .with_categories(rules.categories())
        .with_regions(rules.regions());
    Ok(loader.load(&geo.geoip_dat, &geo.geosite_dat)?)
}

/// Build the routing engine from configuration
///
/// Every group a rule, override or the default policy names must exist
/// in `dispatcher`.
///
/// # Errors
///
/// `RuleError` for unreadable or malformed files and unknown groups,
/// `GeoError` as [`load_geo`].
pub async fn load_router(config: &Config, dispatcher: &Dispatcher) -> Result<Router, AutoproxyError> {
    let hosts = match &config.hosts_file {
        Some(path) => HostsTable::load(path)?,
        None => HostsTable::new(),
    };
    let rules = match &config.rules_file {
        Some(path) => RuleList::load(path)?,
        None => RuleList::new(),
    };

    let geo = load_geo(&config.geo_data, &rules).await?;
    let snapshot = RoutingSnapshotBuilder::new(Arc::new(geo))
        .hosts(hosts)
        .rules(rules)
        .default_policy(Policy::parse(&config.default_policy))
        .build();
    snapshot.validate_policies(|group| dispatcher.has_group(group))?;

    let stats = snapshot.stats();
    info!(
        overrides = stats.overrides,
        rules = stats.rules,
        address_rules = stats.address_rules,
        regions = stats.regions,
        categories = stats.categories,
        default = %config.default_policy,
        "Routing snapshot ready"
    );
    Ok(Router::new(snapshot))
}

/// A configured daemon that has not opened any socket yet
#[derive(Debug)]
pub struct App {
    config: Config,
    handler: Arc<DnsHandler>,
    certs: Arc<CertManager>,
    challenges: ChallengeStore,
}

impl App {
    /// Load routing data and upstream groups
    ///
    /// # Errors
    ///
    /// Any fatal startup condition: geo data, override/rule files, unknown
    /// policies, upstream endpoints.
    pub async fn build(config: Config) -> Result<Self, AutoproxyError> {
        let dispatcher = Dispatcher::from_config(&config.upstream_groups())?;
        info!(groups = ?dispatcher.group_names(), "Upstream groups configured");

        let router = load_router(&config, &dispatcher).await?;
        let handler = Arc::new(DnsHandler::new(Arc::new(router), Arc::new(dispatcher)));

        let challenges = ChallengeStore::new();
        let certs = Arc::new(CertManager::from_config(&config.auto_cert, &config.tls, challenges.clone()));

        Ok(Self {
            config,
            handler,
            certs,
            challenges,
        })
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<DnsHandler> {
        &self.handler
    }

    #[must_use]
    pub fn certs(&self) -> &Arc<CertManager> {
        &self.certs
    }

    /// Bind every configured front-end
    ///
    /// Plain DNS binds first and never waits on the CA. A certificate that
    /// is already on disk (static pair or cache) brings the TLS front-ends
    /// up at once; otherwise issuance runs in the background and they bind
    /// when it publishes a certificate. A front-end that fails to bind is
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// `ConfigError` for an unusable listen address, `DnsError` when no
    /// front-end could be started and none is waiting on a certificate.
    pub async fn start(self) -> Result<RunningApp, AutoproxyError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = RunningApp {
            shutdown: shutdown_tx,
            frontends: Arc::new(Mutex::new(Frontends::default())),
            handler: Arc::clone(&self.handler),
            certs: Arc::clone(&self.certs),
            grace: self.config.server.shutdown_grace(),
        };

        self.start_plain(&running, &shutdown_rx).await?;
        let issuing = self.start_certificates(&running, &shutdown_rx).await?;

        let mut tls_pending = false;
        if let Some(tls) = self.tls_launcher()? {
            if self.certs.has_certificate() {
                tls.launch(&running.frontends, &shutdown_rx).await;
            } else if issuing {
                info!("TLS front-ends start once a certificate is issued");
                tls_pending = true;
                let frontends = Arc::clone(&running.frontends);
                let mut shutdown = shutdown_rx.clone();
                let certs = Arc::clone(&self.certs);
                let task = tokio::spawn(async move {
                    tokio::select! {
                        () = shutdown_requested(&mut shutdown) => {}
                        () = certs.certificate_published() => tls.launch(&frontends, &shutdown).await,
                    }
                });
                running.frontends.lock().tasks.push(task);
            } else {
                warn!(status = %self.certs.status(), "No certificate available, TLS front-ends disabled");
            }
        }

        let (serving, addrs) = {
            let frontends = running.frontends.lock();
            (!frontends.trackers.is_empty() || tls_pending, frontends.addrs)
        };
        if !serving {
            // Stops the HTTP-01 responder and certificate task, if any
            let _ = running.shutdown.send(true);
            return Err(crate::dns::DnsError::network("no DNS front-end could be started").into());
        }
        info!(addrs = ?addrs, tls_pending, "Front-ends running");
        Ok(running)
    }

    /// HTTP-01 responder, local certificates and the issuance/renewal
    /// task; true when an issuance is running in the background
    async fn start_certificates(
        &self,
        running: &RunningApp,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<bool, AutoproxyError> {
        let auto = &self.config.auto_cert;
        if !self.config.wants_tls() && !auto.enabled {
            return Ok(false);
        }

        if auto.enabled {
            let addr = auto
                .http_listen_addr()?
                .ok_or_else(|| ConfigError::validation("auto_cert.http_listen is required for HTTP-01"))?;
            match ChallengeServer::bind(addr, self.challenges.clone()).await {
                Ok(server) => {
                    let mut frontends = running.frontends.lock();
                    frontends.addrs.http01 = Some(server.local_addr());
                    frontends.tasks.push(tokio::spawn(server.run(shutdown.clone())));
                }
                // Issuance will fail validation; the static pair may still cover us.
                Err(e) => error!(error = %e, "HTTP-01 responder not started"),
            }
        }

        let needs_issuance = self.certs.load_local();
        info!(status = %self.certs.status(), needs_issuance, "Certificate state");
        if !self.certs.is_automated() {
            return Ok(false);
        }

        let certs = Arc::clone(&self.certs);
        let mut shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            if needs_issuance {
                tokio::select! {
                    () = shutdown_requested(&mut shutdown) => return,
                    () = certs.issue_now() => {}
                }
                info!(status = %certs.status(), "Certificate state");
            }
            certs.run(shutdown).await;
        });
        running.frontends.lock().tasks.push(task);
        Ok(needs_issuance)
    }

    async fn start_plain(
        &self,
        running: &RunningApp,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), AutoproxyError> {
        let listen = &self.config.listen;
        let options = self.config.server.server_options();

        if let Some(addr) = listen.dns_udp_addr()? {
            match UdpDnsServer::bind(addr, Arc::clone(&self.handler)).await {
                Ok(server) => {
                    let mut frontends = running.frontends.lock();
                    frontends.addrs.udp = Some(server.local_addr());
                    frontends.trackers.push(("udp", server.tracker()));
                    frontends.spawn("udp", server.run(shutdown.clone()));
                }
                Err(e) => error!(addr = %addr, error = %e, "UDP front-end not started"),
            }
        }

        if let Some(addr) = listen.dns_tcp_addr()? {
            match TcpDnsServer::bind(addr, Arc::clone(&self.handler), options).await {
                Ok(server) => {
                    let mut frontends = running.frontends.lock();
                    frontends.addrs.tcp = Some(server.local_addr());
                    frontends.trackers.push(("tcp", server.tracker()));
                    frontends.spawn("tcp", server.run(shutdown.clone()));
                }
                Err(e) => error!(addr = %addr, error = %e, "TCP front-end not started"),
            }
        }
        Ok(())
    }

    /// `None` when no TLS front-end is configured
    fn tls_launcher(&self) -> Result<Option<TlsLauncher>, AutoproxyError> {
        let listen = &self.config.listen;
        let launcher = TlsLauncher {
            dot: listen.dot_addr()?,
            doq: listen.doq_addr()?,
            doh: listen.doh_addr()?,
            doh_path: listen.doh_path.clone(),
            options: self.config.server.server_options(),
            handler: Arc::clone(&self.handler),
            certs: Arc::clone(&self.certs),
        };
        if launcher.dot.is_none() && launcher.doq.is_none() && launcher.doh.is_none() {
            return Ok(None);
        }
        Ok(Some(launcher))
    }
}

/// Everything needed to bring the TLS front-ends up, possibly after
/// `start` has returned
struct TlsLauncher {
    dot: Option<SocketAddr>,
    doq: Option<SocketAddr>,
    doh: Option<SocketAddr>,
    doh_path: String,
    options: ServerOptions,
    handler: Arc<DnsHandler>,
    certs: Arc<CertManager>,
}

impl TlsLauncher {
    async fn launch(self, frontends: &Mutex<Frontends>, shutdown: &watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }
        let resolver = Arc::clone(&self.certs) as Arc<dyn rustls::server::ResolvesServerCert>;

        if let Some(addr) = self.dot {
            let bound = DotServer::bind(addr, Arc::clone(&self.handler), Arc::clone(&resolver), self.options.clone()).await;
            match bound {
                Ok(server) => {
                    let mut frontends = frontends.lock();
                    frontends.addrs.dot = Some(server.local_addr());
                    frontends.trackers.push(("dot", server.tracker()));
                    frontends.spawn("dot", server.run(shutdown.clone()));
                }
                Err(e) => error!(addr = %addr, error = %e, "DoT front-end not started"),
            }
        }

        if let Some(addr) = self.doq {
            match DoqServer::bind(addr, Arc::clone(&self.handler), Arc::clone(&resolver), &self.options) {
                Ok(server) => {
                    let mut frontends = frontends.lock();
                    frontends.addrs.doq = Some(server.local_addr());
                    frontends.trackers.push(("doq", server.tracker()));
                    frontends.spawn("doq", server.run(shutdown.clone()));
                }
                Err(e) => error!(addr = %addr, error = %e, "DoQ front-end not started"),
            }
        }

        if let Some(addr) = self.doh {
            match DohServer::bind(addr, Arc::clone(&self.handler), resolver, &self.doh_path, self.options).await {
                Ok(server) => {
                    let mut frontends = frontends.lock();
                    frontends.addrs.doh = Some(server.local_addr());
                    frontends.trackers.push(("doh", server.tracker()));
                    frontends.spawn("doh", server.run(shutdown.clone()));
                }
                Err(e) => error!(addr = %addr, error = %e, "DoH front-end not started"),
            }
        }
        info!(status = %self.certs.status(), "TLS front-ends started");
    }
}

/// Addresses the front-ends actually bound to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundAddrs {
    pub udp: Option<SocketAddr>,
    pub tcp: Option<SocketAddr>,
    pub dot: Option<SocketAddr>,
    pub doq: Option<SocketAddr>,
    pub doh: Option<SocketAddr>,
    /// HTTP-01 responder
    pub http01: Option<SocketAddr>,
}

/// Bound front-ends and their tasks; appended to when TLS comes up late
#[derive(Debug, Default)]
struct Frontends {
    addrs: BoundAddrs,
    trackers: Vec<(&'static str, Arc<ConnectionTracker>)>,
    tasks: Vec<JoinHandle<()>>,
}

impl Frontends {
    fn spawn<F>(&mut self, transport: &'static str, server: F)
    where
        F: Future<Output = DnsResult<()>> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server.await {
                error!(transport, error = %e, "Front-end stopped with error");
            }
        }));
    }
}

/// Handle to the running front-ends
#[derive(Debug)]
pub struct RunningApp {
    shutdown: watch::Sender<bool>,
    frontends: Arc<Mutex<Frontends>>,
    handler: Arc<DnsHandler>,
    certs: Arc<CertManager>,
    grace: Duration,
}

impl RunningApp {
    /// Addresses bound so far; TLS entries fill in once a certificate
    /// is published
    #[must_use]
    pub fn addrs(&self) -> BoundAddrs {
        self.frontends.lock().addrs
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<DnsHandler> {
        &self.handler
    }

    #[must_use]
    pub fn certs(&self) -> &Arc<CertManager> {
        &self.certs
    }

    /// Stop accepting, then give open connections the grace period
    ///
    /// Returns `true` when everything drained in time.
    pub async fn shutdown(self) -> bool {
        info!(grace_secs = self.grace.as_secs(), "Shutting down");
        let _ = self.shutdown.send(true);

        let deadline = Instant::now() + self.grace;
        let mut drained = true;
        let trackers = self.frontends.lock().trackers.clone();
        for (transport, tracker) in &trackers {
            let left = deadline.saturating_duration_since(Instant::now());
            if !tracker.wait_idle(left).await {
                warn!(transport, active = tracker.active(), "Connections still open after grace period");
                drained = false;
            }
        }

        // A late TLS launch may push server tasks while the first batch joins.
        loop {
            let tasks = std::mem::take(&mut self.frontends.lock().tasks);
            if tasks.is_empty() {
                break;
            }
            let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
            let left = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(left, join_all(tasks)).await.is_err() {
                aborts.iter().for_each(AbortHandle::abort);
                drained = false;
                break;
            }
        }

        let stats = self.handler.stats().snapshot();
        info!(
            received = stats.queries_received,
            answered = stats.queries_answered,
            servfail = stats.servfail,
            malformed = stats.malformed,
            rerouted = stats.rerouted,
            "Query totals"
        );
        drained
    }
}
