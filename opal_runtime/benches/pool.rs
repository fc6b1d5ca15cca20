//! Allocator pool benchmarks: freelist reuse vs. fresh bump allocation, and
//! the live-index probe the error dumper leans on.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use opal_runtime::Pool;

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool");

    group.bench_function("small_alloc_free", |b| {
        let mut pool = Pool::new();
        b.iter(|| {
            let p = pool.alloc_small(black_box(48));
            unsafe { pool.dealloc(p, 48) };
        });
    });

    group.bench_function("small_alloc_churn_64", |b| {
        let mut pool = Pool::new();
        let mut held = Vec::with_capacity(64);
        b.iter(|| {
            for _ in 0..64 {
                held.push(pool.alloc_small(black_box(32)));
            }
            for p in held.drain(..) {
                unsafe { pool.dealloc(p, 32) };
            }
        });
    });

    group.bench_function("large_alloc_free", |b| {
        let mut pool = Pool::new();
        b.iter(|| {
            let p = pool.alloc(black_box(4096));
            unsafe { pool.dealloc(p, 4096) };
        });
    });

    group.bench_function("pointer_probe", |b| {
        let mut pool = Pool::new();
        let live: Vec<_> = (0..1024).map(|_| pool.alloc_small(64)).collect();
        let probe = live[512].as_ptr() as usize;
        b.iter(|| black_box(pool.pointer_is_in_allocator(black_box(probe))));
        for p in live {
            unsafe { pool.dealloc(p, 64) };
        }
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free);
criterion_main!(benches);
