use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ratewindow::{AcquireOptions, Bucket, Clock, InMemoryBucket, Limiter, Rate, RateItem, SystemClock};

use std::sync::Arc;
use std::time::Duration;

// Large enough that the admission check never rejects; short enough that leaks keep the log small.
fn roomy() -> Vec<Rate> {
    vec![Rate::new(1_000_000_000, 100).unwrap()]
}

fn bucket_put_admitted(c: &mut Criterion) {
    let bucket = InMemoryBucket::new(roomy()).unwrap();
    let clock = SystemClock::new();
    let mut n: u64 = 0;

    c.bench_function("in_memory_put_admitted", |b| {
        b.iter(|| {
            n += 1;
            let now = clock.now_millis();
            if n % 4_096 == 0 {
                let _ = bucket.leak(now);
            }
            let item = RateItem::new("bench", now, 1).unwrap();
            black_box(bucket.put(black_box(&item)).unwrap());
        });
    });
}

fn bucket_put_rejected(c: &mut Criterion) {
    let rates = vec![Rate::new(100, 60_000).unwrap(), Rate::new(1_000, 3_600_000).unwrap()];
    let bucket = InMemoryBucket::new(rates).unwrap();
    let clock = SystemClock::new();
    bucket.put(&RateItem::new("bench", clock.now_millis(), 100).unwrap()).unwrap();

    c.bench_function("in_memory_put_rejected_with_waiting", |b| {
        b.iter(|| {
            let item = RateItem::new("bench", clock.now_millis(), 1).unwrap();
            let admitted = bucket.put(black_box(&item)).unwrap();
            black_box(admitted);
            black_box(bucket.waiting(&item).unwrap());
        });
    });
}

fn limiter_sync_admitted(c: &mut Criterion) {
    let limiter = Limiter::builder()
        .bucket(Arc::new(InMemoryBucket::new(roomy()).unwrap()))
        .leak_interval(Duration::from_millis(50))
        .build()
        .unwrap();

    c.bench_function("limiter_try_acquire_admitted", |b| {
        b.iter(|| black_box(limiter.try_acquire(black_box("bench"), 1).unwrap()));
    });
}

fn limiter_sync_refused(c: &mut Criterion) {
    let limiter = Limiter::new(Arc::new(InMemoryBucket::new(vec![Rate::new(1, 60_000).unwrap()]).unwrap())).unwrap();
    limiter.try_acquire("bench", 1).unwrap();

    c.bench_function("limiter_try_acquire_refused_non_blocking", |b| {
        b.iter(|| black_box(limiter.try_acquire_with("bench", 1, AcquireOptions::non_blocking()).unwrap()));
    });
}

fn limiter_async_admitted(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter = rt.block_on(async {
        Limiter::builder()
            .bucket(Arc::new(InMemoryBucket::new(roomy()).unwrap()))
            .leak_interval(Duration::from_millis(50))
            .build()
            .unwrap()
    });

    c.bench_function("limiter_try_acquire_async_admitted", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(limiter.try_acquire_async(black_box("bench"), 1).await.unwrap());
        });
    });
}

criterion_group!(
    benches,
    bucket_put_admitted,
    bucket_put_rejected,
    limiter_sync_admitted,
    limiter_sync_refused,
    limiter_async_admitted
);
criterion_main!(benches);
