//! Shared fixtures: fake upstreams, geo databases, certificates, clients

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use prost::Message as _;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use doh_autoproxy::config::{load_config_str, Config};
use doh_autoproxy::dns::response;
use doh_autoproxy::geo::{Cidr, Domain, DomainType, GeoIp, GeoIpList, GeoSite, GeoSiteList};

pub const TLS_NAME: &str = "localhost";

/// Region US in the test geoip.dat
pub const US_ADDR: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);
/// Region CN in the test geoip.dat
pub const CN_ADDR: Ipv4Addr = Ipv4Addr::new(1, 0, 1, 9);
/// Not covered by any region
pub const OTHER_ADDR: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);

/// UDP upstream answering every A query with one fixed address
pub struct FakeUpstream {
    pub addr: SocketAddr,
    calls: Arc<AtomicUsize>,
}

impl FakeUpstream {
    pub async fn answering(ip: Ipv4Addr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else { return };
                let Ok(query) = Message::from_vec(&buf[..len]) else { continue };
                counter.fetch_add(1, Ordering::SeqCst);
                let reply = response::local_answer(&query, &[IpAddr::V4(ip)]);
                let _ = socket.send_to(&reply.to_vec().unwrap(), peer).await;
            }
        });
        Self { addr, calls }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }
}

pub fn geoip_bytes() -> Vec<u8> {
    let region = |code: &str, ip: [u8; 4], prefix: u32| GeoIp {
        country_code: code.into(),
        cidr: vec![Cidr {
            ip: ip.to_vec(),
            prefix,
        }],
        ..Default::default()
    };
    GeoIpList {
        entry: vec![region("US", [198, 51, 100, 0], 24), region("CN", [1, 0, 1, 0], 24)],
    }
    .encode_to_vec()
}

pub fn geosite_bytes() -> Vec<u8> {
    let site = |code: &str, domain: &str| GeoSite {
        country_code: code.into(),
        domain: vec![Domain {
            r#type: DomainType::Domain as i32,
            value: domain.into(),
            attribute: Vec::new(),
        }],
        ..Default::default()
    };
    GeoSiteList {
        entry: vec![site("STREAMING", "video.example"), site("CN", "example.cn")],
    }
    .encode_to_vec()
}

/// Write both databases into `dir`
pub fn write_geo(dir: &Path) -> (PathBuf, PathBuf) {
    let ip = dir.join("geoip.dat");
    let site = dir.join("geosite.dat");
    std::fs::write(&ip, geoip_bytes()).unwrap();
    std::fs::write(&site, geosite_bytes()).unwrap();
    (ip, site)
}

/// Minimal configuration: plain UDP/TCP on loopback, geo files in `dir`,
/// then `patch` merged over the top level
pub fn config(dir: &TempDir, upstreams: Value, default_policy: &str, patch: Value) -> Config {
    let (ip, site) = write_geo(dir.path());
    let mut json = serde_json::json!({
        "listen": { "dns_udp": "127.0.0.1:0", "dns_tcp": "127.0.0.1:0" },
        "upstreams": upstreams,
        "default_policy": default_policy,
        "geo_data": { "geoip_dat": ip, "geosite_dat": site },
        "server": { "query_timeout_secs": 2, "shutdown_grace_secs": 1 },
    });
    merge(&mut json, patch);
    load_config_str(&json.to_string()).unwrap()
}

fn merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                merge(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, patch) => *base = patch,
    }
}

/// One upstream per group
pub fn groups(pairs: &[(&str, &FakeUpstream)]) -> Value {
    let mut map = serde_json::Map::new();
    for (name, upstream) in pairs {
        map.insert((*name).to_string(), serde_json::json!([{ "address": upstream.address() }]));
    }
    Value::Object(map)
}

pub fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

pub fn query(id: u16, name: &str) -> Vec<u8> {
    let mut query = Message::new();
    query.set_id(id);
    query.set_recursion_desired(true);
    query.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    query.to_vec().unwrap()
}

pub async fn udp_exchange(server: SocketAddr, bytes: &[u8]) -> Message {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(bytes, server).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    Message::from_vec(&buf[..len]).unwrap()
}

pub fn addrs(message: &Message) -> Vec<IpAddr> {
    response::answer_addrs(message)
}

/// Self-signed certificate for `localhost` written as PEM files
pub fn write_cert(dir: &TempDir) -> (PathBuf, PathBuf, CertificateDer<'static>) {
    let certified = rcgen::generate_simple_self_signed(vec![TLS_NAME.to_string()]).unwrap();
    let cert_path = write_file(dir, "cert.pem", &certified.cert.pem());
    let key_path = write_file(dir, "key.pem", &certified.key_pair.serialize_pem());
    (cert_path, key_path, certified.cert.der().clone())
}

pub fn client_tls(cert: &CertificateDer<'static>, alpn: &[&[u8]]) -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.add(cert.clone()).unwrap();
    let mut config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    config
}

/// Plain HTTP/1.1 server returning `body` for every request
pub async fn serve_bytes(body: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            let body = body.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(&body).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}
