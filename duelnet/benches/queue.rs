//! Benchmark: matchmaking queue under churn
//!
//! Run: cargo bench --bench queue

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::time::Duration;

use duelnet::Matchmaker;
use tokio::time::Instant;

const TIMEOUT: Duration = Duration::from_secs(120);

fn fill(queue: &Matchmaker, users: &[String], now: Instant) {
    for (i, user) in users.iter().enumerate() {
        let _ = queue.enqueue(user.as_str(), user.as_str(), i as u64, now);
    }
}

fn bench_enqueue_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_pop_pair");
    for size in [16usize, 256, 1024] {
        let users: Vec<String> = (0..size).map(|i| format!("user-{}", i)).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &users, |b, users| {
            let queue = Matchmaker::new(TIMEOUT);
            b.iter(|| {
                fill(&queue, users, Instant::now());
                while let Some(pair) = queue.pop_pair() {
                    black_box(pair);
                }
            });
        });
    }
    group.finish();
}

fn bench_position(c: &mut Criterion) {
    let users: Vec<String> = (0..1024).map(|i| format!("user-{}", i)).collect();
    let queue = Matchmaker::new(TIMEOUT);
    fill(&queue, &users, Instant::now());

    c.bench_function("position_tail_1024", |b| {
        b.iter(|| black_box(queue.position("user-1023")))
    });
}

fn bench_evict_expired(c: &mut Criterion) {
    let users: Vec<String> = (0..1024).map(|i| format!("user-{}", i)).collect();

    c.bench_function("evict_expired_1024", |b| {
        b.iter(|| {
            let queue = Matchmaker::new(Duration::ZERO);
            let now = Instant::now();
            fill(&queue, &users, now);
            black_box(queue.evict_expired(now + Duration::from_secs(1)))
        })
    });
}

criterion_group!(benches, bench_enqueue_pop, bench_position, bench_evict_expired);
criterion_main!(benches);
