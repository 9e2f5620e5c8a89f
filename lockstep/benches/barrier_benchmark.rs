//! Barrier hand-off latency.
//!
//! `uncontended` is the cost of a single-party release (lock, enroll check,
//! generation bump). `ping_pong` is one full two-thread rendezvous per
//! iteration for each wait strategy.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use lockstep::barrier::{Barrier, WaitStrategy};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

fn bench_uncontended(c: &mut Criterion) {
    let barrier = Barrier::new(1).unwrap();
    c.bench_function("barrier_uncontended", |b| {
        b.iter(|| black_box(barrier.wait().unwrap()));
    });
}

fn bench_ping_pong(c: &mut Criterion) {
    let mut group = c.benchmark_group("barrier_ping_pong");
    group.sample_size(50);

    for &spins in &[0u32, 100, 10_000] {
        let strategy = WaitStrategy::from_spins(spins);
        let barrier = Arc::new(Barrier::new(2).unwrap());
        let done = Arc::new(AtomicBool::new(false));

        // The peer mirrors every wait until the barrier is poisoned.
        let peer = {
            let barrier = barrier.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    if barrier.wait_with(strategy).is_err() {
                        break;
                    }
                }
            })
        };

        group.bench_with_input(BenchmarkId::new("spins", spins), &strategy, |b, &strategy| {
            b.iter(|| black_box(barrier.wait_with(strategy).unwrap()));
        });

        done.store(true, Ordering::Relaxed);
        barrier.poison();
        peer.join().unwrap();
    }

    group.finish();
}

criterion_group!(benches, bench_uncontended, bench_ping_pong);
criterion_main!(benches);
