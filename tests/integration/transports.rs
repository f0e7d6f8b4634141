//! Front-end equivalence and certificate fallback
//!
//! The same query must produce the same answer records over UDP, TCP,
//! DoT, DoQ and DoH; a failed or stalled issuance must leave plain DNS
//! serving.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hickory_proto::op::Message;
use http::{header, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use quinn::crypto::rustls::QuicClientConfig;
use rustls::pki_types::{CertificateDer, ServerName};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use doh_autoproxy::app::App;
use doh_autoproxy::cert::CertStatus;
use doh_autoproxy::dns::framing::{read_frame, write_frame};

use super::support::*;

async fn tcp_exchange(server: SocketAddr, bytes: &[u8]) -> Message {
    let mut stream = TcpStream::connect(server).await.unwrap();
    write_frame(&mut stream, bytes).await.unwrap();
    Message::from_vec(&read_frame(&mut stream).await.unwrap().unwrap()).unwrap()
}

async fn dot_exchange(server: SocketAddr, cert: &CertificateDer<'static>, bytes: &[u8]) -> Message {
    let connector = TlsConnector::from(Arc::new(client_tls(cert, &[b"dot"])));
    let tcp = TcpStream::connect(server).await.unwrap();
    let mut tls = connector
        .connect(ServerName::try_from(TLS_NAME).unwrap(), tcp)
        .await
        .unwrap();
    write_frame(&mut tls, bytes).await.unwrap();
    Message::from_vec(&read_frame(&mut tls).await.unwrap().unwrap()).unwrap()
}

async fn doq_exchange(server: SocketAddr, cert: &CertificateDer<'static>, bytes: &[u8]) -> Message {
    let tls = client_tls(cert, &[b"doq"]);
    let config = quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(tls).unwrap()));
    let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
    endpoint.set_default_client_config(config);
    let conn = endpoint.connect(server, TLS_NAME).unwrap().await.unwrap();

    let (mut send, mut recv) = conn.open_bi().await.unwrap();
    let mut framed = u16::try_from(bytes.len()).unwrap().to_be_bytes().to_vec();
    framed.extend_from_slice(bytes);
    send.write_all(&framed).await.unwrap();
    send.finish().unwrap();

    let data = recv.read_to_end(65_537).await.unwrap();
    conn.close(0u32.into(), b"done");
    endpoint.wait_idle().await;
    Message::from_vec(&data[2..]).unwrap()
}

async fn doh_exchange(server: SocketAddr, cert: &CertificateDer<'static>, bytes: &[u8]) -> Message {
    let connector = TlsConnector::from(Arc::new(client_tls(cert, &[b"http/1.1"])));
    let tcp = TcpStream::connect(server).await.unwrap();
    let tls = connector
        .connect(ServerName::try_from(TLS_NAME).unwrap(), tcp)
        .await
        .unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await.unwrap();
    tokio::spawn(conn);

    let request = Request::post("/dns-query")
        .header(header::HOST, TLS_NAME)
        .header(header::CONTENT_TYPE, "application/dns-message")
        .header(header::ACCEPT, "application/dns-message")
        .body(Full::new(Bytes::copy_from_slice(bytes)))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/dns-message");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    Message::from_vec(&body).unwrap()
}

#[tokio::test]
async fn test_all_transports_answer_identically() {
    let dir = TempDir::new().unwrap();
    let upstream = FakeUpstream::answering(OTHER_ADDR).await;
    let (cert_file, key_file, cert) = write_cert(&dir);
    let config = config(
        &dir,
        groups(&[("fixed", &upstream)]),
        "fixed",
        json!({
            "listen": { "dot": "127.0.0.1:0", "doq": "127.0.0.1:0", "doh": "127.0.0.1:0" },
            "tls": { "cert_file": cert_file, "key_file": key_file },
        }),
    );

    let running = App::build(config).await.unwrap().start().await.unwrap();
    assert_eq!(running.certs().status(), CertStatus::Valid);
    let bound = running.addrs();

    let name = "same.example.";
    let replies = [
        udp_exchange(bound.udp.unwrap(), &query(11, name)).await,
        tcp_exchange(bound.tcp.unwrap(), &query(12, name)).await,
        dot_exchange(bound.dot.unwrap(), &cert, &query(13, name)).await,
        doq_exchange(bound.doq.unwrap(), &cert, &query(0, name)).await,
        doh_exchange(bound.doh.unwrap(), &cert, &query(0, name)).await,
    ];

    let expected = replies[0].answers().to_vec();
    assert_eq!(addrs(&replies[0]), vec![IpAddr::V4(OTHER_ADDR)]);
    for (reply, id) in replies.iter().zip([11u16, 12, 13, 0, 0]) {
        assert_eq!(reply.id(), id);
        assert_eq!(reply.answers(), expected.as_slice());
    }
    assert_eq!(upstream.calls(), 5);

    assert!(running.shutdown().await);
}

/// Poll until the certificate manager leaves the issuing states
async fn settled_status(running: &doh_autoproxy::app::RunningApp) -> CertStatus {
    for _ in 0..100 {
        let status = running.certs().status();
        if !matches!(status, CertStatus::Uninitialized | CertStatus::Issuing) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    running.certs().status()
}

fn auto_cert_patch(dir: &TempDir, directory_url: &str) -> serde_json::Value {
    json!({
        "listen": { "dot": "127.0.0.1:0", "doh": "127.0.0.1:0" },
        "auto_cert": {
            "enabled": true,
            "domains": ["dns.invalid"],
            "cache_dir": dir.path().join("certs"),
            "directory_url": directory_url,
            "http_listen": "127.0.0.1:0",
        },
    })
}

#[tokio::test]
async fn test_failed_issuance_disables_tls_only() {
    let dir = TempDir::new().unwrap();
    let upstream = FakeUpstream::answering(OTHER_ADDR).await;
    // Nothing listens on port 1; the directory fetch fails at once
    let patch = auto_cert_patch(&dir, "https://127.0.0.1:1/directory");
    let config = config(&dir, groups(&[("fixed", &upstream)]), "fixed", patch);

    let running = App::build(config).await.unwrap().start().await.unwrap();
    assert_eq!(settled_status(&running).await, CertStatus::Failed);
    assert!(!running.certs().has_certificate());

    let bound = running.addrs();
    assert!(bound.dot.is_none());
    assert!(bound.doh.is_none());
    assert!(bound.http01.is_some());

    let reply = udp_exchange(bound.udp.unwrap(), &query(21, "still.works.")).await;
    assert_eq!(addrs(&reply), vec![IpAddr::V4(OTHER_ADDR)]);
    let reply = tcp_exchange(bound.tcp.unwrap(), &query(22, "still.works.")).await;
    assert_eq!(addrs(&reply), vec![IpAddr::V4(OTHER_ADDR)]);

    running.shutdown().await;
}

#[tokio::test]
async fn test_stalled_ca_does_not_delay_plain_dns() {
    // Accepts connections and never answers
    let ca = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ca_addr = ca.local_addr().unwrap();
    let hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = ca.accept().await {
            held.push(stream);
        }
    });

    let dir = TempDir::new().unwrap();
    let upstream = FakeUpstream::answering(OTHER_ADDR).await;
    let patch = auto_cert_patch(&dir, &format!("https://{ca_addr}/directory"));
    let config = config(&dir, groups(&[("fixed", &upstream)]), "fixed", patch);

    let started = Instant::now();
    let running = tokio::time::timeout(Duration::from_secs(5), async {
        App::build(config).await.unwrap().start().await.unwrap()
    })
    .await
    .expect("start must not wait for the CA");
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(matches!(
        running.certs().status(),
        CertStatus::Uninitialized | CertStatus::Issuing
    ));
    assert!(!running.certs().has_certificate());
    let bound = running.addrs();
    assert!(bound.dot.is_none() && bound.doh.is_none());

    let reply = udp_exchange(bound.udp.unwrap(), &query(23, "while.issuing.")).await;
    assert_eq!(addrs(&reply), vec![IpAddr::V4(OTHER_ADDR)]);
    let reply = tcp_exchange(bound.tcp.unwrap(), &query(24, "while.issuing.")).await;
    assert_eq!(addrs(&reply), vec![IpAddr::V4(OTHER_ADDR)]);

    // The pending issuance must not hold shutdown up either
    let stopping = Instant::now();
    assert!(running.shutdown().await);
    assert!(stopping.elapsed() < Duration::from_secs(5));
    hold.abort();
}
