// Criterion benchmarks for corral-client pickers
//
// Run benchmarks with:
//   cargo bench -p corral-client

use std::sync::Arc;
use std::time::Duration;

use corral_client::{Balancer, RoundRobin, RoundRobinBalancer, Subchannel};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn subchannels(count: usize) -> Vec<Arc<Subchannel>> {
    (0..count)
        .map(|i| Arc::new(Subchannel::new(format!("10.0.{}.{}:9001", i / 250, i % 250 + 1), Duration::from_secs(1))))
        .collect()
}

fn bench_picker_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("picker_build");

    for count in [2, 10, 50].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let ready = subchannels(count);
            b.iter(|| RoundRobinBalancer.build_picker(black_box(ready.clone())));
        });
    }

    group.finish();
}

fn bench_pick(c: &mut Criterion) {
    let mut group = c.benchmark_group("pick");

    for count in [2, 5, 10, 20].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let picker = RoundRobinBalancer.build_picker(subchannels(count));
            b.iter(|| black_box(picker.pick()));
        });
    }

    group.bench_function("empty_fails_fast", |b| {
        let picker = RoundRobinBalancer.build_picker(Vec::new());
        b.iter(|| black_box(picker.pick()).is_err());
    });

    group.finish();
}

fn bench_round_robin_distribution(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_robin_distribution");

    group.bench_function("10_entries_100_calls", |b| {
        let entries: Vec<String> = (0..10).map(|i| format!("node{}", i)).collect();
        b.iter(|| {
            let rr = RoundRobin::new(entries.clone());
            for _ in 0..100 {
                black_box(rr.next());
            }
        });
    });

    group.bench_function("20_entries_200_calls", |b| {
        let entries: Vec<String> = (0..20).map(|i| format!("node{}", i)).collect();
        b.iter(|| {
            let rr = RoundRobin::new(entries.clone());
            for _ in 0..200 {
                black_box(rr.next());
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_picker_build, bench_pick, bench_round_robin_distribution);
criterion_main!(benches);
