//! Performance benchmarks for the routing engine.
//!
//! Run with: `cargo bench --bench rule_matching`
//!
//! Covers the lookups on the query path:
//! - Region resolution (longest-prefix match over geoip ranges)
//! - Site category matching (suffix / keyword / regex)
//! - Pre-resolution decisions against rule lists of growing size
//! - Post-resolution decisions with address rules

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use doh_autoproxy::geo::{GeoStore, RegionTable, SiteCategoryTable, SiteMatcher};
use doh_autoproxy::rules::{HostsTable, Policy, Router, RoutingSnapshotBuilder, RuleList};

// ============================================================================
// Helper Functions
// ============================================================================

/// Geo store with `ranges` /24 ranges split across four regions and two
/// site categories
fn build_geo(ranges: usize) -> GeoStore {
    let mut regions = RegionTable::builder();
    for i in 0..ranges {
        let code = ["CN", "US", "JP", "DE"][i % 4];
        let net = format!("10.{}.{}.0/24", (i / 256) % 256, i % 256);
        regions.insert(net.parse().expect("valid CIDR"), code);
    }
    regions.insert("10.0.0.0/8".parse().expect("valid CIDR"), "XX");

    let mut sites = SiteCategoryTable::new();
    let mut cn = SiteMatcher::builder("cn");
    for i in 0..1000 {
        cn = cn.add_domain(&format!("site{i}.cn"));
    }
    sites.insert("cn", cn.add_keyword("baidu").build().expect("valid matcher"));
    let ads = SiteMatcher::builder("ads")
        .add_keyword("tracker")
        .add_regex(r"^ad[0-9]+\.")
        .expect("valid regex")
        .build()
        .expect("valid matcher");
    sites.insert("ads", ads);

    GeoStore::from_tables(regions.build(), sites)
}

/// Router with `rule_count` domain rules after the category rules
fn build_router(rule_count: usize) -> Router {
    let mut text = String::from("geosite:ads block\ngeosite:cn domestic\n");
    for i in 0..rule_count {
        text.push_str(&format!("domain:domain{i}.com overseas\n"));
    }
    text.push_str("region:CN domestic\nip:192.168.0.0/16 domestic\n");

    let rules = RuleList::parse(&text, Path::new("rules.txt")).expect("valid rules");
    let hosts = HostsTable::parse("router.lan 192.168.1.1\n", Path::new("hosts")).expect("valid hosts");
    let snapshot = RoutingSnapshotBuilder::new(Arc::new(build_geo(4096)))
        .hosts(hosts)
        .rules(rules)
        .default_policy(Policy::parse("overseas"))
        .build();
    Router::new(snapshot)
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_region_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("region_lookup");
    for ranges in [256, 4096, 65_536] {
        let geo = build_geo(ranges);
        let hit = IpAddr::V4(Ipv4Addr::new(10, 0, 3, 7));
        let miss = IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1));
        group.bench_with_input(BenchmarkId::new("hit", ranges), &geo, |b, geo| {
            b.iter(|| geo.resolve_region(black_box(hit)));
        });
        group.bench_with_input(BenchmarkId::new("miss", ranges), &geo, |b, geo| {
            b.iter(|| geo.resolve_region(black_box(miss)));
        });
    }
    group.finish();
}

fn bench_category_match(c: &mut Criterion) {
    let geo = build_geo(16);
    let mut group = c.benchmark_group("category_match");
    for (label, name, tag) in [
        ("suffix_hit", "www.site500.cn", "cn"),
        ("keyword_hit", "map.baidu.com", "cn"),
        ("regex_hit", "ad42.example.net", "ads"),
        ("miss", "www.example.org", "cn"),
    ] {
        group.bench_function(label, |b| {
            b.iter(|| geo.matches_category(black_box(name), tag));
        });
    }
    group.finish();
}

fn bench_decide_pre(c: &mut Criterion) {
    let mut group = c.benchmark_group("decide_pre");
    for rule_count in [10, 100, 1000] {
        let router = build_router(rule_count);
        group.bench_with_input(BenchmarkId::new("override", rule_count), &router, |b, r| {
            b.iter(|| r.decide_pre(black_box("router.lan")));
        });
        group.bench_with_input(BenchmarkId::new("category", rule_count), &router, |b, r| {
            b.iter(|| r.decide_pre(black_box("img.site7.cn")));
        });
        group.bench_with_input(BenchmarkId::new("last_domain", rule_count), &router, |b, r| {
            let name = format!("www.domain{}.com", rule_count - 1);
            b.iter(|| r.decide_pre(black_box(&name)));
        });
        group.bench_with_input(BenchmarkId::new("default", rule_count), &router, |b, r| {
            b.iter(|| r.decide_pre(black_box("unmatched.example.org")));
        });
    }
    group.finish();
}

fn bench_decide_post(c: &mut Criterion) {
    let router = build_router(100);
    let name = "unmatched.example.org";
    let pre = router.decide_pre(name);
    let in_region = [IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))];
    let outside: Vec<IpAddr> = (1..=8).map(|i| IpAddr::V4(Ipv4Addr::new(203, 0, 113, i))).collect();

    let mut group = c.benchmark_group("decide_post");
    group.bench_function("region_reroute", |b| {
        b.iter(|| router.decide_post(black_box(name), black_box(&in_region), &pre));
    });
    group.bench_function("no_match_8_addrs", |b| {
        b.iter(|| router.decide_post(black_box(name), black_box(&outside), &pre));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_region_lookup,
    bench_category_match,
    bench_decide_pre,
    bench_decide_post
);
criterion_main!(benches);
