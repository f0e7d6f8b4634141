//! ACME issuance (RFC 8555) with HTTP-01 validation

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, Order,
    OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::challenge::ChallengeStore;
use super::error::{CertError, CertResult};

/// Account credentials file inside the cache directory
const ACCOUNT_FILE: &str = "acme-account.json";

/// Polls of the order state before giving up
const MAX_POLLS: u32 = 10;

/// First poll delay; doubles each round up to [`MAX_POLL_DELAY`]
const INITIAL_POLL_DELAY: Duration = Duration::from_millis(500);
const MAX_POLL_DELAY: Duration = Duration::from_secs(16);

/// Upper bound on a single request to the CA
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// A freshly issued chain and key, PEM encoded
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub chain_pem: String,
    pub key_pem: String,
}

/// Something that can obtain a certificate for a set of names
#[async_trait]
pub trait CertIssuer: Send + Sync + std::fmt::Debug {
    /// Issue a certificate covering `domains` (first one is primary)
    async fn issue(&self, domains: &[String]) -> CertResult<IssuedCert>;
}

/// `instant-acme` client answering HTTP-01 challenges through a
/// [`ChallengeStore`]
#[derive(Debug)]
pub struct AcmeIssuer {
    directory_url: String,
    email: Option<String>,
    cache_dir: PathBuf,
    challenges: ChallengeStore,
    exchange_timeout: Duration,
}

impl AcmeIssuer {
    #[must_use]
    pub fn new(
        directory_url: impl Into<String>,
        email: Option<String>,
        cache_dir: impl Into<PathBuf>,
        challenges: ChallengeStore,
    ) -> Self {
        Self {
            directory_url: directory_url.into(),
            email,
            cache_dir: cache_dir.into(),
            challenges,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_exchange_timeout(mut self, limit: Duration) -> Self {
        self.exchange_timeout = limit;
        self
    }

    /// Run one CA request, failing with [`CertError::Timeout`] when it stalls
    async fn exchange<T, E, F>(&self, what: &str, request: F) -> CertResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        match timeout(self.exchange_timeout, request).await {
            Ok(result) => result.map_err(CertError::acme),
            Err(_) => Err(CertError::Timeout(format!("{what} after {:?}", self.exchange_timeout))),
        }
    }

    /// Reuse the cached account or register a new one
    async fn account(&self) -> CertResult<Account> {
        let path = self.cache_dir.join(ACCOUNT_FILE);
        if let Some(credentials) = read_credentials(&path)? {
            match self.exchange("account lookup", Account::from_credentials(credentials)).await {
                Ok(account) => {
                    debug!(path = %path.display(), "Using cached ACME account");
                    return Ok(account);
                }
                Err(e) => warn!(error = %e, "Cached ACME account rejected, registering a new one"),
            }
        }

        let contact: Vec<String> = self.email.iter().map(|e| format!("mailto:{e}")).collect();
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();
        let new_account = NewAccount {
            contact: &contact,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let (account, credentials) = self
            .exchange(
                "account registration",
                Account::create(&new_account, &self.directory_url, None),
            )
            .await?;
        info!(directory = %self.directory_url, "Registered ACME account");

        let json = serde_json::to_vec_pretty(&credentials).map_err(|e| CertError::Acme(e.to_string()))?;
        super::write_private(&path, &json)?;
        Ok(account)
    }

    /// Publish key authorizations for every pending authorization and tell
    /// the CA they are ready; returns the tokens to clean up
    async fn publish_challenges(&self, order: &mut Order) -> CertResult<Vec<String>> {
        let authorizations = self.exchange("authorization fetch", order.authorizations()).await?;
        let mut tokens = Vec::new();
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                other => return Err(CertError::Acme(format!("authorization in state {other:?}"))),
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| CertError::Acme("CA offered no HTTP-01 challenge".into()))?;

            let key_auth = order.key_authorization(challenge);
            self.challenges.insert(challenge.token.clone(), key_auth.as_str());
            tokens.push(challenge.token.clone());
            self.exchange("challenge ready", order.set_challenge_ready(&challenge.url))
                .await?;
        }
        Ok(tokens)
    }

    async fn run_order(&self, account: &Account, domains: &[String]) -> CertResult<IssuedCert> {
        let identifiers: Vec<Identifier> = domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let new_order = NewOrder {
            identifiers: &identifiers,
        };
        let mut order = self.exchange("new order", account.new_order(&new_order)).await?;

        let tokens = self.publish_challenges(&mut order).await?;
        let outcome = self.finish_order(&mut order, domains).await;
        for token in &tokens {
            self.challenges.remove(token);
        }
        outcome
    }

    async fn finish_order(&self, order: &mut Order, domains: &[String]) -> CertResult<IssuedCert> {
        let mut delay = INITIAL_POLL_DELAY;
        let mut polls = 0;
        loop {
            let state = self.exchange("order refresh", order.refresh()).await?;
            match state.status {
                OrderStatus::Ready => break,
                OrderStatus::Invalid => return Err(CertError::Acme("order became invalid".into())),
                _ => {}
            }
            polls += 1;
            if polls >= MAX_POLLS {
                return Err(CertError::Timeout("order to become ready".into()));
            }
            sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }

        let mut params = CertificateParams::new(domains.to_vec()).map_err(|e| CertError::KeyGen(e.to_string()))?;
        params.distinguished_name = DistinguishedName::new();
        let key = KeyPair::generate().map_err(|e| CertError::KeyGen(e.to_string()))?;
        let csr = params.serialize_request(&key).map_err(|e| CertError::KeyGen(e.to_string()))?;
        self.exchange("order finalize", order.finalize(csr.der())).await?;

        let mut delay = INITIAL_POLL_DELAY;
        for _ in 0..MAX_POLLS {
            if let Some(chain_pem) = self.exchange("certificate download", order.certificate()).await? {
                return Ok(IssuedCert {
                    chain_pem,
                    key_pem: key.serialize_pem(),
                });
            }
            sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }
        Err(CertError::Timeout("certificate download".into()))
    }
}

#[async_trait]
impl CertIssuer for AcmeIssuer {
    async fn issue(&self, domains: &[String]) -> CertResult<IssuedCert> {
        if domains.is_empty() {
            return Err(CertError::Config("no domains to issue for".into()));
        }
        info!(domains = ?domains, directory = %self.directory_url, "Requesting certificate");
        super::install_default_provider();
        let account = self.account().await?;
        self.run_order(&account, domains).await
    }
}

fn read_credentials(path: &Path) -> CertResult<Option<AccountCredentials>> {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable ACME account file");
                Ok(None)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CertError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_or_corrupt_account_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(ACCOUNT_FILE);
        assert!(read_credentials(&path).unwrap().is_none());

        std::fs::write(&path, b"{ not json").unwrap();
        assert!(read_credentials(&path).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_issue_requires_domains() {
        let dir = TempDir::new().unwrap();
        let issuer = AcmeIssuer::new("https://acme.invalid/directory", None, dir.path(), ChallengeStore::new());
        let err = issuer.issue(&[]).await.unwrap_err();
        assert!(matches!(err, CertError::Config(_)));
    }

    #[tokio::test]
    async fn test_stalled_directory_times_out() {
        // Accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let dir = TempDir::new().unwrap();
        let issuer = AcmeIssuer::new(format!("https://{addr}/directory"), None, dir.path(), ChallengeStore::new())
            .with_exchange_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = issuer.issue(&["dns.example.com".to_string()]).await.unwrap_err();
        assert!(matches!(err, CertError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        hold.abort();
    }
}
