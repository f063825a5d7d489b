//! Fan-out benchmarks for roomcast.
//!
//! Measures the cost of delivering one bus payload to every member of a room.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use roomcast_core::{BridgeConfig, BusBridge, ConnectionHandle, LocalBus, RoomRegistry};
use roomcast_protocol::{codec, Envelope};
use roomcast_transport::ConnectionId;
use std::sync::Arc;
use tokio::sync::mpsc;

fn setup(members: usize) -> (BusBridge, Vec<mpsc::Receiver<bytes::Bytes>>) {
    let registry = Arc::new(RoomRegistry::new());
    let mut receivers = Vec::with_capacity(members);

    for i in 0..members {
        let (handle, rx) = ConnectionHandle::channel(ConnectionId::new(format!("conn-{}", i)), 16);
        registry.add_member(1, &handle);
        receivers.push(rx);
    }

    let bridge = BusBridge::new(Arc::new(LocalBus::new()), registry, BridgeConfig::default());
    (bridge, receivers)
}

/// Benchmark fan-out to rooms of increasing size.
fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    let payload = codec::encode(&Envelope::message(7, 1, "x".repeat(128))).unwrap();

    for members in [1usize, 10, 100, 1000] {
        let (bridge, mut receivers) = setup(members);
        group.throughput(Throughput::Elements(members as u64));
        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, _| {
            b.iter(|| {
                let delivered = bridge.fan_out(black_box(payload.clone()));
                for rx in &mut receivers {
                    let _ = rx.try_recv();
                }
                delivered
            });
        });
    }

    group.finish();
}

/// Benchmark join and exit churn on the registry.
fn bench_membership(c: &mut Criterion) {
    let mut group = c.benchmark_group("membership");
    let registry = RoomRegistry::new();
    let (handle, _rx) = ConnectionHandle::channel(ConnectionId::new("conn-bench"), 16);

    group.bench_function("join_exit", |b| {
        b.iter(|| {
            registry.add_member(black_box(1), &handle);
            registry.remove_member(black_box(1), handle.id());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_fan_out, bench_membership);
criterion_main!(benches);
