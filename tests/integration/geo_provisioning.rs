//! Geo database provisioning at startup

use std::net::IpAddr;

use serde_json::json;
use tempfile::TempDir;

use doh_autoproxy::app::App;
use doh_autoproxy::error::AutoproxyError;

use super::support::*;

#[tokio::test]
async fn test_empty_database_is_downloaded_before_start() {
    let dir = TempDir::new().unwrap();
    let upstream = FakeUpstream::answering(US_ADDR).await;
    let other = FakeUpstream::answering(CN_ADDR).await;
    let rules = write_file(&dir, "rules", "region:US other\n");
    let file_server = serve_bytes(geoip_bytes()).await;

    let mut config = config(
        &dir,
        groups(&[("main", &upstream), ("other", &other)]),
        "main",
        json!({
            "rules_file": rules,
            "geo_data": { "geoip_download_url": format!("http://{file_server}/geoip.dat") },
        }),
    );
    // Truncate the database written by the fixture
    std::fs::write(&config.geo_data.geoip_dat, b"").unwrap();
    config.listen.dns_tcp = String::new();

    let running = App::build(config.clone()).await.unwrap().start().await.unwrap();
    assert_eq!(std::fs::read(&config.geo_data.geoip_dat).unwrap(), geoip_bytes());

    // The downloaded regions drive the post pass
    let reply = udp_exchange(running.addrs().udp.unwrap(), &query(5, "geo.example.")).await;
    assert_eq!(addrs(&reply), vec![IpAddr::V4(CN_ADDR)]);
    assert_eq!((upstream.calls(), other.calls()), (1, 1));

    running.shutdown().await;
}

#[tokio::test]
async fn test_empty_database_without_url_stops_startup() {
    let dir = TempDir::new().unwrap();
    let upstream = FakeUpstream::answering(US_ADDR).await;
    let config = config(&dir, groups(&[("main", &upstream)]), "main", json!({}));
    std::fs::write(&config.geo_data.geosite_dat, b"").unwrap();

    let err = App::build(config.clone()).await.unwrap_err();
    assert!(matches!(err, AutoproxyError::Geo(_)), "{err}");
    // Left untouched for the operator
    assert!(std::fs::read(&config.geo_data.geosite_dat).unwrap().is_empty());
}
