//! Criterion micro-benchmarks for block allocation and stream leasing.

use std::hint::black_box;
use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use plume_bench::release_schedule;
use plume_core::{SimTime, StreamIndex};
use plume_engine::{BatchAllocator, RandomStreams};
use rand::RngCore;

const POOL: usize = 100_000;

fn times() -> Vec<SimTime> {
    release_schedule(POOL, 1).into_iter().map(SimTime).collect()
}

/// One full phase on a single thread: rewind, extend, drain.
fn bench_drain_single(c: &mut Criterion) {
    let times = times();
    let mut group = c.benchmark_group("drain_100k");
    for block_size in [64usize, 256, 1024] {
        let alloc = BatchAllocator::new(POOL, block_size, 42).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(block_size), &block_size, |b, _| {
            b.iter(|| {
                alloc.reset_cursor();
                alloc.advance_releasable_boundary(&times, SimTime(0));
                let mut blocks = 0u32;
                while let Some(a) = alloc.next_batch() {
                    blocks += 1;
                    black_box(a);
                }
                blocks
            });
        });
    }
    group.finish();
}

/// Eight threads racing on the cursor.
fn bench_drain_contended(c: &mut Criterion) {
    let times = times();
    let alloc = Arc::new(BatchAllocator::new(POOL, 64, 42).unwrap());
    c.bench_function("drain_100k_8_threads", |b| {
        b.iter(|| {
            alloc.reset_cursor();
            alloc.advance_releasable_boundary(&times, SimTime(0));
            thread::scope(|s| {
                for _ in 0..8 {
                    let alloc = &alloc;
                    s.spawn(move || {
                        while let Some(a) = alloc.next_batch() {
                            black_box(a);
                        }
                    });
                }
            });
        });
    });
}

fn bench_lease(c: &mut Criterion) {
    let alloc = BatchAllocator::new(POOL, 256, 42).unwrap();
    c.bench_function("lease_and_draw", |b| {
        let mut i = 0u32;
        b.iter(|| {
            let mut lease = alloc.lease(StreamIndex(i % 390));
            i = i.wrapping_add(1);
            black_box(lease.rng().next_u64())
        });
    });
}

fn bench_stream_setup(c: &mut Criterion) {
    c.bench_function("derive_streams_100k", |b| {
        b.iter(|| black_box(RandomStreams::new(42, RandomStreams::required(POOL, 256))));
    });
}

criterion_group!(
    benches,
    bench_drain_single,
    bench_drain_contended,
    bench_lease,
    bench_stream_setup
);
criterion_main!(benches);
