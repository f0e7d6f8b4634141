//! End-to-end routing through the plain UDP front-end
//!
//! Each test starts the whole daemon from a configuration, with fake
//! upstream groups on loopback, and checks which group answered.

use std::net::{IpAddr, Ipv4Addr};

use hickory_proto::op::ResponseCode;
use prost::Message as _;
use serde_json::json;
use tempfile::TempDir;

use doh_autoproxy::app::{load_router, App};
use doh_autoproxy::dns::Dispatcher;
use doh_autoproxy::geo::{Cidr, GeoIp, GeoIpList};

use super::support::*;

#[tokio::test]
async fn test_blocked_override_makes_no_upstream_call() {
    let dir = TempDir::new().unwrap();
    let upstream = FakeUpstream::answering(OTHER_ADDR).await;
    let hosts = write_file(&dir, "hosts", "blocked.example block\n");
    let config = config(
        &dir,
        groups(&[("default", &upstream)]),
        "default",
        json!({ "hosts_file": hosts }),
    );

    let running = App::build(config).await.unwrap().start().await.unwrap();
    let server = running.addrs().udp.unwrap();

    let reply = udp_exchange(server, &query(0x0B10, "blocked.example.")).await;
    assert_eq!(reply.id(), 0x0B10);
    assert_eq!(reply.response_code(), ResponseCode::NXDomain);
    assert!(reply.answers().is_empty());
    assert_eq!(upstream.calls(), 0);

    // Anything else still forwards
    let reply = udp_exchange(server, &query(2, "open.example.")).await;
    assert_eq!(addrs(&reply), vec![IpAddr::V4(OTHER_ADDR)]);
    assert_eq!(upstream.calls(), 1);

    running.shutdown().await;
}

#[tokio::test]
async fn test_address_rule_reroutes_in_post_pass() {
    let dir = TempDir::new().unwrap();
    let policy_a = FakeUpstream::answering(CN_ADDR).await;
    let policy_b = FakeUpstream::answering(OTHER_ADDR).await;
    // Default group answers inside region US
    let policy_c = FakeUpstream::answering(US_ADDR).await;
    let rules = write_file(&dir, "rules", "category:streaming policyA\nregion:US policyB\n");
    let config = config(
        &dir,
        groups(&[("policyA", &policy_a), ("policyB", &policy_b), ("policyC", &policy_c)]),
        "policyC",
        json!({ "rules_file": rules }),
    );

    let running = App::build(config).await.unwrap().start().await.unwrap();
    let server = running.addrs().udp.unwrap();

    let reply = udp_exchange(server, &query(7, "news.example.")).await;
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert_eq!(addrs(&reply), vec![IpAddr::V4(OTHER_ADDR)]);
    assert_eq!((policy_a.calls(), policy_b.calls(), policy_c.calls()), (0, 1, 1));
    assert_eq!(running.handler().stats().snapshot().rerouted, 1);

    // A streaming name is decided by name alone
    let reply = udp_exchange(server, &query(8, "cdn.video.example.")).await;
    assert_eq!(addrs(&reply), vec![IpAddr::V4(CN_ADDR)]);
    assert_eq!((policy_a.calls(), policy_b.calls(), policy_c.calls()), (1, 1, 1));

    running.shutdown().await;
}

#[tokio::test]
async fn test_earlier_rule_wins_and_override_beats_rules() {
    let dir = TempDir::new().unwrap();
    let first = FakeUpstream::answering(CN_ADDR).await;
    let second = FakeUpstream::answering(OTHER_ADDR).await;
    let rules = write_file(&dir, "rules", "domain:example.org first\nfull:www.example.org second\n");
    let hosts = write_file(&dir, "hosts", "pinned.example.org second\nrouter.lan 192.168.1.1\n");
    let config = config(
        &dir,
        groups(&[("first", &first), ("second", &second)]),
        "first",
        json!({ "rules_file": rules, "hosts_file": hosts }),
    );

    let running = App::build(config).await.unwrap().start().await.unwrap();
    let server = running.addrs().udp.unwrap();

    let reply = udp_exchange(server, &query(1, "www.example.org.")).await;
    assert_eq!(addrs(&reply), vec![IpAddr::V4(CN_ADDR)]);
    assert_eq!(second.calls(), 0);

    let reply = udp_exchange(server, &query(2, "pinned.example.org.")).await;
    assert_eq!(addrs(&reply), vec![IpAddr::V4(OTHER_ADDR)]);
    assert_eq!(second.calls(), 1);

    let reply = udp_exchange(server, &query(3, "Router.LAN.")).await;
    assert_eq!(addrs(&reply), vec!["192.168.1.1".parse::<IpAddr>().unwrap()]);
    assert_eq!(first.calls() + second.calls(), 2);

    running.shutdown().await;
}

#[tokio::test]
async fn test_reloading_same_files_decides_identically() {
    let dir = TempDir::new().unwrap();
    let upstream = FakeUpstream::answering(OTHER_ADDR).await;
    let rules = write_file(
        &dir,
        "rules",
        "category:cn domestic\nkeyword:tracker block\nregion:US domestic\nip:203.0.113.0/24 nxdomain\n",
    );
    let hosts = write_file(&dir, "hosts", "nas.lan 10.0.0.2\n");
    let config = config(
        &dir,
        groups(&[("domestic", &upstream), ("overseas", &upstream)]),
        "overseas",
        json!({ "rules_file": rules, "hosts_file": hosts }),
    );

    let dispatcher = Dispatcher::from_config(&config.upstream_groups()).unwrap();
    let first = load_router(&config, &dispatcher).await.unwrap();
    let second = load_router(&config, &dispatcher).await.unwrap();

    let names = ["www.example.cn", "ads.tracker.net", "nas.lan", "example.org", "video.example"];
    let answers: [&[IpAddr]; 3] = [
        &[IpAddr::V4(US_ADDR)],
        &[IpAddr::V4(OTHER_ADDR)],
        &[IpAddr::V4(CN_ADDR)],
    ];
    for name in names {
        let pre_a = first.decide_pre(name);
        let pre_b = second.decide_pre(name);
        assert_eq!(pre_a, pre_b, "{name}");
        for addrs in answers {
            assert_eq!(
                first.decide_post(name, addrs, &pre_a),
                second.decide_post(name, addrs, &pre_b),
                "{name} {addrs:?}"
            );
        }
    }
}

/// US holds 8.0.0.0/8 and CN the nested 8.8.0.0/16
fn nested_geoip(dir: &TempDir) -> std::path::PathBuf {
    let region = |code: &str, ip: [u8; 4], prefix: u32| GeoIp {
        country_code: code.into(),
        cidr: vec![Cidr {
            ip: ip.to_vec(),
            prefix,
        }],
        ..Default::default()
    };
    let list = GeoIpList {
        entry: vec![region("US", [8, 0, 0, 0], 8), region("CN", [8, 8, 0, 0], 16)],
    };
    let path = dir.path().join("nested-geoip.dat");
    std::fs::write(&path, list.encode_to_vec()).unwrap();
    path
}

#[tokio::test]
async fn test_nested_range_of_unreferenced_region_is_not_rerouted() {
    // Only US is named by a rule, so CN is never selected, yet its /16
    // must still beat the US /8 for addresses inside it.
    for (answer, rerouted) in [(Ipv4Addr::new(8, 8, 4, 4), 0), (Ipv4Addr::new(8, 1, 2, 3), 1)] {
        let dir = TempDir::new().unwrap();
        let policy_b = FakeUpstream::answering(OTHER_ADDR).await;
        let policy_c = FakeUpstream::answering(answer).await;
        let rules = write_file(&dir, "rules", "region:US policyB\n");
        let config = config(
            &dir,
            groups(&[("policyB", &policy_b), ("policyC", &policy_c)]),
            "policyC",
            json!({
                "rules_file": rules,
                "geo_data": { "geoip_dat": nested_geoip(&dir) },
            }),
        );

        let running = App::build(config).await.unwrap().start().await.unwrap();
        let server = running.addrs().udp.unwrap();

        let reply = udp_exchange(server, &query(31, "nested.example.")).await;
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        let expected = if rerouted == 0 { answer } else { OTHER_ADDR };
        assert_eq!(addrs(&reply), vec![IpAddr::V4(expected)], "answer {answer}");
        assert_eq!(policy_c.calls(), 1);
        assert_eq!(policy_b.calls(), rerouted);
        assert_eq!(running.handler().stats().snapshot().rerouted, rerouted as u64);

        running.shutdown().await;
    }
}
