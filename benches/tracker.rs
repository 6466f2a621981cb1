//! Benchmarks for softstop hot paths.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use softstop::metrics::MetricsCollector;
use softstop::net::ConnectionId;
use softstop::shutdown::{OperationTracker, ShutdownCoordinator, Signal};

fn benchmark_tracker(c: &mut Criterion) {
    let tracker = OperationTracker::new();

    let mut group = c.benchmark_group("tracker");
    group.throughput(Throughput::Elements(1));

    group.bench_function("begin_end", |b| {
        b.iter(|| {
            tracker.begin();
            black_box(tracker.end()).ok();
        })
    });

    group.bench_function("track_guard", |b| {
        b.iter(|| {
            let guard = tracker.track();
            drop(black_box(guard));
        })
    });

    // With other operations outstanding.
    let _held: Vec<_> = (0..100).map(|_| tracker.track()).collect();
    group.bench_function("track_guard_contended", |b| {
        b.iter(|| {
            let guard = tracker.track();
            drop(black_box(guard));
        })
    });

    group.bench_function("count", |b| {
        b.iter(|| black_box(tracker.count()))
    });

    group.finish();
}

fn benchmark_signal(c: &mut Criterion) {
    let unset = Signal::new();
    let set = Signal::new();
    set.fire();

    let mut group = c.benchmark_group("signal");

    group.bench_function("is_set_unset", |b| {
        b.iter(|| black_box(unset.is_set()))
    });

    group.bench_function("is_set_fired", |b| {
        b.iter(|| black_box(set.is_set()))
    });

    group.finish();
}

fn benchmark_coordinator(c: &mut Criterion) {
    let coordinator = ShutdownCoordinator::new();
    let collector = MetricsCollector::new(coordinator.clone());

    let mut group = c.benchmark_group("coordinator");

    group.bench_function("phase", |b| {
        b.iter(|| black_box(coordinator.phase()))
    });

    group.bench_function("metrics_refresh", |b| {
        b.iter(|| collector.refresh())
    });

    group.bench_function("connection_id", |b| {
        b.iter(|| black_box(ConnectionId::next()))
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_tracker,
    benchmark_signal,
    benchmark_coordinator,
);

criterion_main!(benches);
