//! Query handling benchmarks
//!
//! Run with: `cargo bench --bench dns_parsing`
//!
//! Measures the per-query work every front-end shares: parsing and
//! validating the query, answering locally (overrides and blocks), and
//! the UDP truncation path. No network I/O is involved.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};

use doh_autoproxy::dns::response;
use doh_autoproxy::dns::server::{truncate_for_udp, validate_query, QueryContext, Transport};
use doh_autoproxy::dns::{DnsHandler, Dispatcher};
use doh_autoproxy::geo::GeoStore;
use doh_autoproxy::rules::{HostsTable, Policy, Router, RoutingSnapshotBuilder, RuleList};

fn query_bytes(name: &str) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(0x1234);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_str(name).expect("valid name"), RecordType::A));
    message.to_vec().expect("serializable")
}

/// Handler that never forwards: overrides, blocks and a local default
fn local_handler() -> DnsHandler {
    let hosts = HostsTable::parse("router.lan 192.168.1.1\n", Path::new("hosts")).expect("hosts");
    let rules = RuleList::parse("keyword:tracker block\nfull:gone.example nxdomain\n", Path::new("rules"))
        .expect("rules");
    let fallback: Arc<[IpAddr]> = Arc::from(vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))]);
    let snapshot = RoutingSnapshotBuilder::new(Arc::new(GeoStore::default()))
        .hosts(hosts)
        .rules(rules)
        .default_policy(Policy::Local(fallback))
        .build();
    DnsHandler::new(Arc::new(Router::new(snapshot)), Arc::new(Dispatcher::new()))
}

fn bench_parse_and_validate(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_validate");
    for name in ["example.com.", "a.very.long.subdomain.chain.of.labels.example.org."] {
        let bytes = query_bytes(name);
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &bytes, |b, bytes| {
            b.iter(|| {
                let message = Message::from_vec(black_box(bytes)).expect("parse");
                validate_query(&message).expect("valid");
                message
            });
        });
    }
    group.finish();
}

fn bench_handle_local(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let handler = local_handler();
    let ctx = QueryContext::new(SocketAddr::from(([127, 0, 0, 1], 5353)), Transport::Udp);

    let mut group = c.benchmark_group("handle_local");
    for (label, name) in [
        ("override", "router.lan."),
        ("block", "ads.tracker.net."),
        ("nxdomain", "gone.example."),
        ("default_local", "www.example.com."),
    ] {
        let bytes = query_bytes(name);
        group.bench_with_input(BenchmarkId::from_parameter(label), &bytes, |b, bytes| {
            b.to_async(&runtime)
                .iter(|| async { handler.handle(&ctx, black_box(bytes)).await });
        });
    }
    group.finish();
}

fn bench_truncation(c: &mut Criterion) {
    let query = Message::from_vec(&query_bytes("big.example.")).expect("parse");
    let addrs: Vec<IpAddr> = (0..64u8).map(|i| IpAddr::V4(Ipv4Addr::new(10, 0, 0, i))).collect();
    let reply = response::local_answer(&query, &addrs).to_vec().expect("serializable");

    let mut group = c.benchmark_group("truncate_for_udp");
    group.throughput(Throughput::Bytes(reply.len() as u64));
    group.bench_function("fits", |b| {
        b.iter(|| truncate_for_udp(&query, black_box(reply.clone()), 4096));
    });
    group.bench_function("truncated", |b| {
        b.iter(|| truncate_for_udp(&query, black_box(reply.clone()), 512));
    });
    group.finish();
}

criterion_group!(benches, bench_parse_and_validate, bench_handle_local, bench_truncation);
criterion_main!(benches);
