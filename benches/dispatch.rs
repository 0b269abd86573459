// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Dispatch throughput benchmarks.
//
// Groups:
//   post_one_shot   — alloc + post, no dispatch (allocator + pending queue
//                     insertion cost only)
//   poll_fifo       — post N distinct-target events, then poll() them all
//   poll_coincident — post N same-target events, then poll() them all
//   cancel_pending  — post then cancel before it becomes due

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use equeue::{Clock, Queue, VirtualClock};
use std::sync::Arc;

const COUNTS: &[usize] = &[8, 64, 512];

fn bench_post_one_shot(c: &mut Criterion) {
    let mut group = c.benchmark_group("post_one_shot");

    for &n in COUNTS {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let queue = Queue::with_clock(64 * 1024, VirtualClock::new(0)).unwrap();
                for i in 0..n {
                    let handle = queue.call_in(i as u32, || {}).expect("alloc");
                    black_box(handle);
                }
            });
        });
    }

    group.finish();
}

fn bench_poll_fifo(c: &mut Criterion) {
    let mut group = c.benchmark_group("poll_fifo");

    for &n in COUNTS {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let clock = Arc::new(VirtualClock::new(0));
                let queue = Queue::with_clock(64 * 1024, Arc::clone(&clock)).unwrap();
                for i in 0..n {
                    queue.call_in(i as u32, || {}).expect("alloc");
                }
                clock.advance(n as u32);
                black_box(queue.poll());
            });
        });
    }

    group.finish();
}

fn bench_poll_coincident(c: &mut Criterion) {
    let mut group = c.benchmark_group("poll_coincident");

    for &n in COUNTS {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let clock = Arc::new(VirtualClock::new(0));
                let queue = Queue::with_clock(64 * 1024, Arc::clone(&clock)).unwrap();
                for _ in 0..n {
                    queue.call_in(10, || {}).expect("alloc");
                }
                clock.advance(10);
                black_box(queue.poll());
            });
        });
    }

    group.finish();
}

fn bench_cancel_pending(c: &mut Criterion) {
    let mut group = c.benchmark_group("cancel_pending");

    for &n in COUNTS {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let queue: Queue<VirtualClock> = Queue::with_clock(64 * 1024, VirtualClock::new(0)).unwrap();
            b.iter(|| {
                let handles: Vec<_> = (0..n)
                    .map(|i| queue.call_in(1000 + i as u32, || {}).expect("alloc"))
                    .collect();
                for h in handles {
                    black_box(queue.cancel(h));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_post_one_shot, bench_poll_fifo, bench_poll_coincident, bench_cancel_pending);
criterion_main!(benches);
