//! # Eventbus Benchmarks
//!
//! | Area | Operation |
//! |------|-----------|
//! | Content codec | compress/decompress per encoding |
//! | Topic routing | pattern matching |
//! | Publish | confirm-tracked publish against the in-process broker |
//! | RPC | request/reply round trip |

use amqp_eventbus::domain::{codec, routing};
use amqp_eventbus::testing::MockBroker;
use amqp_eventbus::{
    ContentEncoding, Eventbus, HandlerError, Message, PublishOptions, QoSConfig, RpcOptions,
};
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;
use std::time::Duration;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn connected_bus(rt: &Runtime, broker: &MockBroker) -> Eventbus {
    rt.block_on(async {
        Eventbus::builder(broker.config(), QoSConfig::default())
            .connector(broker.connector())
            .connect()
            .await
            .unwrap()
    })
}

// ============================================================================
// Content codec
// ============================================================================

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("content-codec");
    let body = Bytes::from(r#"{"sku":"A-100","qty":3,"warehouse":"eu-west"}"#.repeat(512));
    group.throughput(Throughput::Bytes(body.len() as u64));

    for encoding in [
        ContentEncoding::Zlib,
        ContentEncoding::Zstd,
        ContentEncoding::Lz4,
    ] {
        let encoded = codec::encode(&body, encoding).unwrap();
        let label = encoding.as_tag().unwrap_or("none");
        group.bench_with_input(BenchmarkId::new("encode", label), &body, |b, body| {
            b.iter(|| black_box(codec::encode(body, encoding).unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("decode", label), &encoded, |b, encoded| {
            b.iter(|| black_box(codec::decode(encoded, encoding).unwrap()))
        });
    }

    group.finish();
}

// ============================================================================
// Topic routing
// ============================================================================

fn bench_topic_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic-routing");
    let cases = [
        ("exact", "orders.eu.created", "orders.eu.created"),
        ("star", "orders.*.created", "orders.eu.created"),
        ("hash", "orders.#", "orders.eu.west.created.v2"),
        ("hash-middle", "orders.#.v2", "orders.eu.west.created.v2"),
        ("miss", "a.example", "abc.example"),
    ];
    for (name, pattern, key) in cases {
        group.bench_function(name, |b| {
            b.iter(|| black_box(routing::topic_matches(black_box(pattern), black_box(key))))
        });
    }
    group.finish();
}

// ============================================================================
// Publish with confirms
// ============================================================================

fn bench_publish(c: &mut Criterion) {
    let rt = runtime();
    let broker = MockBroker::new();
    let bus = connected_bus(&rt, &broker);

    let mut group = c.benchmark_group("publish");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("confirmed_single", |b| {
        b.iter(|| {
            rt.block_on(bus.publish("bench", "tick", "payload", PublishOptions::default()))
                .unwrap()
        })
    });

    for batch in [16usize, 128] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("confirmed_concurrent", batch), &batch, |b, &batch| {
            b.iter(|| {
                rt.block_on(async {
                    let publishes = (0..batch)
                        .map(|_| bus.publish("bench", "tick", "payload", PublishOptions::default()));
                    let results = join_all(publishes).await;
                    black_box(results.iter().filter(|r| r.is_ok()).count())
                })
            })
        });
    }

    group.finish();
    rt.block_on(bus.dispose(true)).unwrap();
}

// ============================================================================
// RPC round trip
// ============================================================================

fn bench_rpc(c: &mut Criterion) {
    let rt = runtime();
    let broker = MockBroker::new();
    let bus = connected_bus(&rt, &broker);
    rt.block_on(bus.provide_resource("bench.echo", |r: Message| async move {
        Ok::<Bytes, HandlerError>(r.body)
    }))
    .unwrap();

    let mut group = c.benchmark_group("rpc");
    group.measurement_time(Duration::from_secs(5));
    let options = RpcOptions::default().with_timeout(Duration::from_secs(5));

    group.bench_function("echo_round_trip", |b| {
        b.iter(|| {
            rt.block_on(bus.rpc_client(
                "eventbus_rpc_exchange",
                "bench.echo",
                "ping",
                options.clone(),
            ))
            .unwrap()
        })
    });

    group.finish();
    rt.block_on(bus.dispose(true)).unwrap();
}

criterion_group!(
    benches,
    bench_codec,
    bench_topic_matching,
    bench_publish,
    bench_rpc,
);

criterion_main!(benches);
