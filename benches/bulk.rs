use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sysexec::{just, sync_wait, ExecutionContext, SenderExt, ThreadPool};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn bulk_dispatch(c: &mut Criterion) {
    let pool = ThreadPool::builder().with_split_threshold(64).build();
    let ctx = ExecutionContext::with_thread_pool(&pool);
    let scheduler = ctx.get_scheduler();

    let mut group = c.benchmark_group("bulk");
    for &size in &[16usize, 1024, 65536] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let sum = Arc::new(AtomicU64::new(0));
            b.iter(|| {
                let sum = sum.clone();
                let work = scheduler.bulk(just(3u64), size, move |index, value: &u64| {
                    sum.fetch_add(black_box(index as u64 * *value), Ordering::Relaxed);
                });
                sync_wait(work).unwrap()
            });
        });
    }
    group.finish();

    c.bench_function("schedule", |b| {
        b.iter(|| sync_wait(scheduler.schedule().then(|()| black_box(1u32))).unwrap())
    });

    pool.shut_down().wait();
}

criterion_group!(benches, bulk_dispatch);
criterion_main!(benches);
