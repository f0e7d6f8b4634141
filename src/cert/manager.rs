//! Certificate state machine and per-handshake resolver
//!
//! ```text
//! Uninitialized ──▶ Issuing ──▶ Valid ──▶ Renewing ──▶ Valid
//!                      │                     │
//!                      └──────▶ Failed ◀─────┘  (retried after a back-off)
//! ```
//!
//! The current [`CertState`] lives behind an `ArcSwap`; handshakes load it
//! without locking, and a handshake that already loaded the old key keeps
//! using it while a renewal swaps in the new one.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::acme::{AcmeIssuer, CertIssuer};
use super::challenge::ChallengeStore;
use super::error::CertResult;
use super::tls::{load_pem, load_pem_files, renewal_deadline, LoadedCert};
use crate::config::{AutoCertConfig, TlsConfig};
use crate::dns::server::shutdown_requested;

/// Back-off after a failed issuance
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

/// Default renewal margin before expiry
pub const DEFAULT_RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    Uninitialized,
    Issuing,
    Valid,
    Renewing,
    Failed,
}

impl fmt::Display for CertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Issuing => "issuing",
            Self::Valid => "valid",
            Self::Renewing => "renewing",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where the served certificate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertSource {
    /// Issued during this run
    Issued,
    /// Loaded from the cache directory
    Cache,
    /// `tls.cert_file` / `tls.key_file`
    Static,
}

/// Snapshot of the certificate state
#[derive(Clone)]
pub struct CertState {
    pub status: CertStatus,
    pub key: Option<Arc<CertifiedKey>>,
    pub source: Option<CertSource>,
    pub not_after: Option<SystemTime>,
    /// When the renewal task will next try to issue
    pub next_attempt: Option<SystemTime>,
}

impl CertState {
    const fn empty() -> Self {
        Self {
            status: CertStatus::Uninitialized,
            key: None,
            source: None,
            not_after: None,
            next_attempt: None,
        }
    }
}

impl fmt::Debug for CertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertState")
            .field("status", &self.status)
            .field("has_key", &self.key.is_some())
            .field("source", &self.source)
            .field("not_after", &self.not_after)
            .field("next_attempt", &self.next_attempt)
            .finish()
    }
}

/// Owns the served certificate and its renewal
pub struct CertManager {
    state: ArcSwap<CertState>,
    issuer: Option<Arc<dyn CertIssuer>>,
    domains: Vec<String>,
    cache_dir: Option<PathBuf>,
    static_files: Option<(PathBuf, PathBuf)>,
    renew_before: Duration,
    retry_after: Duration,
    /// Flips to true the first time a key is installed
    published: watch::Sender<bool>,
}

impl fmt::Debug for CertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertManager")
            .field("state", &self.state.load())
            .field("domains", &self.domains)
            .field("automated", &self.issuer.is_some())
            .finish()
    }
}

impl CertManager {
    #[must_use]
    pub fn builder() -> CertManagerBuilder {
        CertManagerBuilder::default()
    }

    /// Manager wired from configuration; issuance uses `challenges` for
    /// HTTP-01 tokens
    #[must_use]
    pub fn from_config(auto: &AutoCertConfig, tls: &TlsConfig, challenges: ChallengeStore) -> Self {
        let mut builder = Self::builder().renew_before(auto.renew_before());
        if auto.enabled {
            builder = builder
                .issuer(Arc::new(AcmeIssuer::new(
                    auto.directory_url.clone(),
                    auto.email.clone(),
                    auto.cache_dir.clone(),
                    challenges,
                )))
                .domains(auto.domains.clone())
                .cache_dir(auto.cache_dir.clone());
        }
        if let Some((cert, key)) = tls.pair() {
            builder = builder.static_files(cert.clone(), key.clone());
        }
        builder.build()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> Arc<CertState> {
        self.state.load_full()
    }

    #[must_use]
    pub fn status(&self) -> CertStatus {
        self.state.load().status
    }

    /// Whether TLS front-ends have something to present
    #[must_use]
    pub fn has_certificate(&self) -> bool {
        self.state.load().key.is_some()
    }

    /// Whether automated issuance is configured
    #[must_use]
    pub fn is_automated(&self) -> bool {
        self.issuer.is_some()
    }

    /// Obtain the first certificate
    ///
    /// Order: a cached certificate (renewed at once when inside the
    /// renewal margin), then a new issuance, then the static pair. Failures are logged; the outcome is
    /// visible through [`Self::status`] and [`Self::has_certificate`].
    pub async fn initialize(&self) {
        if self.load_local() {
            self.issue_now().await;
        }
    }

    /// Install whatever is available without talking to the CA: the static
    /// pair when issuance is off, otherwise a cached certificate
    ///
    /// Returns true when an issuance should still run.
    pub fn load_local(&self) -> bool {
        if self.issuer.is_none() {
            self.install_static(CertStatus::Valid);
            return false;
        }

        if let Some(cached) = self.load_cached() {
            let deadline = renewal_deadline(cached.not_after, self.renew_before);
            info!(domains = ?self.domains, "Using cached certificate");
            self.install(cached, CertSource::Cache);
            if deadline > SystemTime::now() {
                return false;
            }
            // Still served if the renewal fails.
            debug!("Cached certificate is within the renewal margin");
        }
        true
    }

    /// Resolves once a certificate has been installed
    pub async fn certificate_published(&self) {
        let mut published = self.published.subscribe();
        // The sender lives in `self`, so this only ends on `true`.
        let _ = published.wait_for(|ready| *ready).await;
    }

    /// Issue (or renew) immediately
    pub async fn issue_now(&self) {
        let Some(issuer) = self.issuer.as_ref() else { return };

        let current = self.state.load_full();
        let in_progress = if current.key.is_some() && current.status == CertStatus::Valid {
            CertStatus::Renewing
        } else {
            CertStatus::Issuing
        };
        self.state.store(Arc::new(CertState {
            status: in_progress,
            ..(*current).clone()
        }));

        match self.obtain(issuer.as_ref()).await {
            Ok(loaded) => {
                info!(domains = ?self.domains, "Certificate issued");
                self.install(loaded, CertSource::Issued);
            }
            Err(e) => {
                error!(domains = ?self.domains, error = %e, retry_in = ?self.retry_after, "Certificate issuance failed");
                self.mark_failed();
            }
        }
    }

    async fn obtain(&self, issuer: &dyn CertIssuer) -> CertResult<LoadedCert> {
        let issued = issuer.issue(&self.domains).await?;
        let loaded = load_pem(issued.chain_pem.as_bytes(), issued.key_pem.as_bytes(), "issued certificate")?;
        if let Some(dir) = &self.cache_dir {
            let (chain_path, key_path) = self.cache_paths(dir);
            if let Err(e) = super::write_private(&chain_path, issued.chain_pem.as_bytes())
                .and_then(|()| super::write_private(&key_path, issued.key_pem.as_bytes()))
            {
                warn!(error = %e, "Failed to cache issued certificate");
            }
        }
        Ok(loaded)
    }

    /// Keep the current key if there is one (an expiring certificate
    /// still beats none), otherwise fall back to the static pair
    fn mark_failed(&self) {
        let current = self.state.load_full();
        if current.key.is_none() && self.install_static(CertStatus::Failed) {
            self.schedule_retry();
            return;
        }
        self.state.store(Arc::new(CertState {
            status: CertStatus::Failed,
            next_attempt: Some(SystemTime::now() + self.retry_after),
            ..(*current).clone()
        }));
    }

    fn schedule_retry(&self) {
        self.state.rcu(|s| CertState {
            next_attempt: Some(SystemTime::now() + self.retry_after),
            ..(**s).clone()
        });
    }

    fn install(&self, loaded: LoadedCert, source: CertSource) {
        let next_attempt = self
            .issuer
            .as_ref()
            .map(|_| renewal_deadline(loaded.not_after, self.renew_before));
        self.state.store(Arc::new(CertState {
            status: CertStatus::Valid,
            key: Some(loaded.key),
            source: Some(source),
            not_after: Some(loaded.not_after),
            next_attempt,
        }));
        self.published.send_replace(true);
    }

    /// Load the static pair with the given status; false when there is
    /// none or it cannot be read
    fn install_static(&self, status: CertStatus) -> bool {
        let Some((cert, key)) = &self.static_files else {
            if self.issuer.is_none() {
                info!("No certificate configured, TLS front-ends stay disabled");
            }
            return false;
        };
        match load_pem_files(cert, key) {
            Ok(loaded) => {
                info!(cert = %cert.display(), "Using static certificate");
                self.state.store(Arc::new(CertState {
                    status,
                    key: Some(loaded.key),
                    source: Some(CertSource::Static),
                    not_after: Some(loaded.not_after),
                    next_attempt: None,
                }));
                self.published.send_replace(true);
                true
            }
            Err(e) => {
                error!(cert = %cert.display(), error = %e, "Failed to load static certificate");
                self.state.rcu(|s| CertState {
                    status: CertStatus::Failed,
                    ..(**s).clone()
                });
                false
            }
        }
    }

    fn cache_paths(&self, dir: &std::path::Path) -> (PathBuf, PathBuf) {
        let primary = self.domains.first().map_or("certificate", String::as_str);
        (dir.join(format!("{primary}.crt.pem")), dir.join(format!("{primary}.key.pem")))
    }

    fn load_cached(&self) -> Option<LoadedCert> {
        let dir = self.cache_dir.as_ref()?;
        let (chain_path, key_path) = self.cache_paths(dir);
        if !chain_path.exists() {
            return None;
        }
        match load_pem_files(&chain_path, &key_path) {
            Ok(loaded) => Some(loaded),
            Err(e) => {
                warn!(path = %chain_path.display(), error = %e, "Ignoring unusable cached certificate");
                None
            }
        }
    }

    /// Time until the renewal task should act, `None` when nothing is
    /// scheduled
    #[must_use]
    pub fn next_delay(&self) -> Option<Duration> {
        self.issuer.as_ref()?;
        let at = self.state.load().next_attempt?;
        Some(at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
    }

    /// Renewal loop; returns on shutdown or when nothing is scheduled
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let Some(delay) = self.next_delay() else {
                debug!("No certificate renewal scheduled");
                return;
            };
            debug!(in_secs = delay.as_secs(), "Next certificate attempt scheduled");
            tokio::select! {
                () = shutdown_requested(&mut shutdown) => return,
                () = tokio::time::sleep(delay) => self.issue_now().await,
            }
        }
    }
}

impl ResolvesServerCert for CertManager {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.state.load().key.clone()
    }
}

/// Builder for [`CertManager`]
#[derive(Default)]
pub struct CertManagerBuilder {
    issuer: Option<Arc<dyn CertIssuer>>,
    domains: Vec<String>,
    cache_dir: Option<PathBuf>,
    static_files: Option<(PathBuf, PathBuf)>,
    renew_before: Option<Duration>,
    retry_after: Option<Duration>,
}

impl CertManagerBuilder {
    #[must_use]
    pub fn issuer(mut self, issuer: Arc<dyn CertIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    #[must_use]
    pub fn domains(mut self, domains: Vec<String>) -> Self {
        self.domains = domains;
        self
    }

    #[must_use]
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn static_files(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.static_files = Some((cert.into(), key.into()));
        self
    }

    #[must_use]
    pub fn renew_before(mut self, margin: Duration) -> Self {
        self.renew_before = Some(margin);
        self
    }

    #[must_use]
    pub fn retry_after(mut self, backoff: Duration) -> Self {
        self.retry_after = Some(backoff);
        self
    }

    #[must_use]
    pub fn build(self) -> CertManager {
        CertManager {
            state: ArcSwap::from_pointee(CertState::empty()),
            issuer: self.issuer,
            domains: self.domains,
            cache_dir: self.cache_dir,
            static_files: self.static_files,
            renew_before: self.renew_before.unwrap_or(DEFAULT_RENEW_BEFORE),
            retry_after: self.retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            published: watch::channel(false).0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::acme::IssuedCert;
    use crate::cert::error::CertError;
    use crate::cert::tls::test_certs::self_signed_pem;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const DOMAIN: &str = "dns.example.com";

    /// Issues self-signed certificates valid for `days`, or fails
    #[derive(Debug)]
    struct FakeIssuer {
        days: Option<i64>,
        calls: AtomicUsize,
    }

    impl FakeIssuer {
        fn valid_for(days: i64) -> Arc<Self> {
            Arc::new(Self {
                days: Some(days),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                days: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CertIssuer for FakeIssuer {
        async fn issue(&self, domains: &[String]) -> CertResult<IssuedCert> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let days = self.days.ok_or_else(|| CertError::Acme("CA unreachable".into()))?;
            let (chain_pem, key_pem) = self_signed_pem(&domains[0], days);
            Ok(IssuedCert { chain_pem, key_pem })
        }
    }

    fn write_static(dir: &TempDir, days: i64) -> (PathBuf, PathBuf) {
        let (chain, key) = self_signed_pem(DOMAIN, days);
        let cert_path = dir.path().join("static.crt");
        let key_path = dir.path().join("static.key");
        std::fs::write(&cert_path, chain).unwrap();
        std::fs::write(&key_path, key).unwrap();
        (cert_path, key_path)
    }

    #[tokio::test]
    async fn test_issuance_success_schedules_renewal() {
        let dir = TempDir::new().unwrap();
        let issuer = FakeIssuer::valid_for(90);
        let manager = CertManager::builder()
            .issuer(issuer.clone())
            .domains(vec![DOMAIN.into()])
            .cache_dir(dir.path())
            .build();
        assert_eq!(manager.status(), CertStatus::Uninitialized);
        assert!(!manager.has_certificate());

        manager.initialize().await;
        let state = manager.state();
        assert_eq!(state.status, CertStatus::Valid);
        assert_eq!(state.source, Some(CertSource::Issued));
        assert!(manager.has_certificate());

        // 90 day certificate, 30 day margin: next attempt in about 60 days
        let delay = manager.next_delay().unwrap();
        assert!(delay > Duration::from_secs(59 * 86_400));
        assert!(delay < Duration::from_secs(61 * 86_400));

        assert!(dir.path().join(format!("{DOMAIN}.crt.pem")).exists());
        assert!(dir.path().join(format!("{DOMAIN}.key.pem")).exists());
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_certificate_skips_issuance() {
        let dir = TempDir::new().unwrap();
        let (chain, key) = self_signed_pem(DOMAIN, 80);
        std::fs::write(dir.path().join(format!("{DOMAIN}.crt.pem")), chain).unwrap();
        std::fs::write(dir.path().join(format!("{DOMAIN}.key.pem")), key).unwrap();

        let issuer = FakeIssuer::valid_for(90);
        let manager = CertManager::builder()
            .issuer(issuer.clone())
            .domains(vec![DOMAIN.into()])
            .cache_dir(dir.path())
            .build();
        manager.initialize().await;

        assert_eq!(manager.state().source, Some(CertSource::Cache));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cached_certificate_inside_margin_is_renewed() {
        let dir = TempDir::new().unwrap();
        let (chain, key) = self_signed_pem(DOMAIN, 10);
        std::fs::write(dir.path().join(format!("{DOMAIN}.crt.pem")), chain).unwrap();
        std::fs::write(dir.path().join(format!("{DOMAIN}.key.pem")), key).unwrap();

        let issuer = FakeIssuer::valid_for(90);
        let manager = CertManager::builder()
            .issuer(issuer.clone())
            .domains(vec![DOMAIN.into()])
            .cache_dir(dir.path())
            .build();
        manager.initialize().await;

        assert_eq!(manager.state().source, Some(CertSource::Issued));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_static_and_retries() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_static(&dir, 365);
        let manager = CertManager::builder()
            .issuer(FakeIssuer::failing())
            .domains(vec![DOMAIN.into()])
            .static_files(cert, key)
            .build();
        manager.initialize().await;

        let state = manager.state();
        assert_eq!(state.status, CertStatus::Failed);
        assert_eq!(state.source, Some(CertSource::Static));
        assert!(manager.has_certificate());

        let delay = manager.next_delay().unwrap();
        assert!(delay <= DEFAULT_RETRY_AFTER);
        assert!(delay > DEFAULT_RETRY_AFTER - Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_failure_without_fallback_leaves_tls_disabled() {
        let manager = CertManager::builder()
            .issuer(FakeIssuer::failing())
            .domains(vec![DOMAIN.into()])
            .build();
        manager.initialize().await;

        assert_eq!(manager.status(), CertStatus::Failed);
        assert!(!manager.has_certificate());
        assert!(manager.next_delay().is_some());
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_current_key() {
        let manager = CertManager::builder()
            .issuer(FakeIssuer::failing())
            .domains(vec![DOMAIN.into()])
            .build();
        let (chain, key) = self_signed_pem(DOMAIN, 5);
        manager.install(load_pem(chain.as_bytes(), key.as_bytes(), "test").unwrap(), CertSource::Issued);
        let before = manager.state().key.clone().unwrap();

        manager.issue_now().await;

        let state = manager.state();
        assert_eq!(state.status, CertStatus::Failed);
        assert!(Arc::ptr_eq(state.key.as_ref().unwrap(), &before));
    }

    #[tokio::test]
    async fn test_load_local_defers_issuance() {
        let issuer = FakeIssuer::valid_for(90);
        let manager = Arc::new(
            CertManager::builder()
                .issuer(issuer.clone())
                .domains(vec![DOMAIN.into()])
                .build(),
        );
        assert!(manager.load_local());
        assert!(!manager.has_certificate());
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);

        let waiter = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.certificate_published().await }
        });
        manager.issue_now().await;
        tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(manager.state().source, Some(CertSource::Issued));

        // Already published: returns at once
        tokio::time::timeout(Duration::from_secs(1), manager.certificate_published())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_static_only() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_static(&dir, 30);
        let manager = CertManager::builder().static_files(cert, key).build();
        manager.initialize().await;

        assert_eq!(manager.status(), CertStatus::Valid);
        assert_eq!(manager.state().source, Some(CertSource::Static));
        assert!(manager.next_delay().is_none());

        let unconfigured = CertManager::builder().build();
        unconfigured.initialize().await;
        assert_eq!(unconfigured.status(), CertStatus::Uninitialized);
        assert!(!unconfigured.has_certificate());
    }

    #[tokio::test]
    async fn test_unreadable_static_pair_is_failed() {
        let manager = CertManager::builder()
            .static_files("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .build();
        manager.initialize().await;
        assert_eq!(manager.status(), CertStatus::Failed);
        assert!(!manager.has_certificate());
    }
}
