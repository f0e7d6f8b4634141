//! Geo database provisioning
//!
//! Before the store is loaded each database file goes through
//! [`ensure_geo_file`]:
//!
//! | file state        | URL configured | outcome                          |
//! |-------------------|----------------|----------------------------------|
//! | present, non-empty| any            | used as is                       |
//! | absent or empty   | yes            | downloaded and atomically swapped|
//! | absent            | no             | fatal (`NoDownloadSource`)       |
//! | empty             | no             | left alone, the loader rejects it|
//!
//! Downloads go through the same hyper + rustls client stack as the DoH
//! upstream client, follow a bounded number of redirects, and land in a
//! sibling temporary file that is renamed over the target.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http::{header, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::{info, warn};

use super::error::GeoError;

/// Maximum redirects followed for a single download
const MAX_REDIRECTS: usize = 5;

/// Overall time allowed for one download
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Which database a file holds (for log messages)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoKind {
    /// `geoip.dat`
    GeoIp,
    /// `geosite.dat`
    GeoSite,
}

impl fmt::Display for GeoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GeoIp => write!(f, "GeoIP"),
            Self::GeoSite => write!(f, "GeoSite"),
        }
    }
}

/// What [`ensure_geo_file`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provision {
    /// File was already usable
    Present,
    /// File was fetched; carries the byte count
    Downloaded(u64),
    /// File exists but is empty and there is no URL to refresh it
    LeftEmpty,
}

/// True when the file is absent or zero length
///
/// Other stat errors (permissions, ...) return false so the loader
/// reports them instead of a download masking them.
#[must_use]
pub fn should_download(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.len() == 0,
        Err(e) => e.kind() == std::io::ErrorKind::NotFound,
    }
}

/// Make sure a database file is usable before loading
///
/// # Errors
///
/// - `GeoError::DownloadFailed` / `GeoError::Io` when a fetch fails
/// - `GeoError::NoDownloadSource` when the file is absent and `url` is `None`
pub async fn ensure_geo_file(
    kind: GeoKind,
    path: &Path,
    url: Option<&str>,
) -> Result<Provision, GeoError> {
    if !should_download(path) {
        return Ok(Provision::Present);
    }

    match url.filter(|u| !u.is_empty()) {
        Some(url) => {
            info!(kind = %kind, path = %path.display(), url, "Database missing or empty, downloading");
            let size = download_file(path, url).await?;
            info!(kind = %kind, path = %path.display(), bytes = size, "Database downloaded");
            Ok(Provision::Downloaded(size))
        }
        None => {
            if path.exists() {
                warn!(kind = %kind, path = %path.display(), "Database is empty and no download URL is configured");
                Ok(Provision::LeftEmpty)
            } else {
                Err(GeoError::NoDownloadSource {
                    path: path.to_path_buf(),
                })
            }
        }
    }
}

/// Download `url` and atomically replace `path` with the body
///
/// # Errors
///
/// Returns `GeoError::DownloadFailed` on network/HTTP failure or an empty
/// body, `GeoError::Io` if the file cannot be written.
pub async fn download_file(path: &Path, url: &str) -> Result<u64, GeoError> {
    let body = timeout(DOWNLOAD_TIMEOUT, fetch(url))
        .await
        .map_err(|_| GeoError::download(url, format!("timed out after {DOWNLOAD_TIMEOUT:?}")))??;

    if body.is_empty() {
        return Err(GeoError::download(url, "server returned an empty body"));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| GeoError::io(parent, e))?;
    }

    let tmp = temp_path(path);
    tokio::fs::write(&tmp, &body)
        .await
        .map_err(|e| GeoError::io(&tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(GeoError::io(path, e));
    }

    Ok(body.len() as u64)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".download");
    path.with_file_name(name)
}

async fn fetch(url: &str) -> Result<Bytes, GeoError> {
    let tls = crate::dns::client::webpki_client_config().map_err(|e| GeoError::download(url, e.to_string()))?;
    let https = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build(https);

    let mut uri: Uri = url
        .parse()
        .map_err(|e| GeoError::download(url, format!("invalid URL: {e}")))?;

    for _ in 0..=MAX_REDIRECTS {
        let request = Request::get(uri.clone())
            .header(header::USER_AGENT, concat!("doh-autoproxy/", env!("CARGO_PKG_VERSION")))
            .body(Empty::<Bytes>::new())
            .map_err(|e| GeoError::download(url, e.to_string()))?;

        let response = client
            .request(request)
            .await
            .map_err(|e| GeoError::download(url, e.to_string()))?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| GeoError::download(url, format!("HTTP {status} without Location")))?;
            uri = resolve_redirect(&uri, location)
                .ok_or_else(|| GeoError::download(url, format!("bad redirect target '{location}'")))?;
            continue;
        }
        if status != StatusCode::OK {
            return Err(GeoError::download(url, format!("HTTP {status}")));
        }

        let collected = response
            .into_body()
            .collect()
            .await
            .map_err(|e| GeoError::download(url, format!("failed to read body: {e}")))?;
        return Ok(collected.to_bytes());
    }

    Err(GeoError::download(url, format!("more than {MAX_REDIRECTS} redirects")))
}

/// Resolve a `Location` header against the request URI
fn resolve_redirect(base: &Uri, location: &str) -> Option<Uri> {
    if let Ok(absolute) = location.parse::<Uri>() {
        if absolute.scheme().is_some() {
            return Some(absolute);
        }
    }
    if !location.starts_with('/') {
        return None;
    }
    let scheme = base.scheme_str()?;
    let authority = base.authority()?;
    format!("{scheme}://{authority}{location}").parse().ok()
}
