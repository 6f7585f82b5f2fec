use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stage_runtime::{
    AcceptAll, BoundedQueue, EnqueuePredicate, QueueThresholdPredicate, RateLimitingPredicate,
    Sink, StageStats,
};
use std::sync::Arc;
use std::time::Duration;

fn sink_with(predicate: Arc<dyn EnqueuePredicate>) -> Sink<u64> {
    Sink::new(BoundedQueue::unbounded(), predicate, StageStats::new())
}

fn benchmark_raw_queue(c: &mut Criterion) {
    c.bench_function("queue_enqueue_drain_1000", |b| {
        let queue = BoundedQueue::unbounded();
        b.iter(|| {
            for i in 0..1000u64 {
                let _ = queue.enqueue(black_box(i));
            }
            black_box(queue.dequeue_all());
        });
    });
}

fn benchmark_accept_all(c: &mut Criterion) {
    c.bench_function("sink_accept_all_1000", |b| {
        let sink = sink_with(Arc::new(AcceptAll));
        b.iter(|| {
            for i in 0..1000u64 {
                let _ = sink.enqueue(black_box(i));
            }
            black_box(sink.queue().dequeue_all());
        });
    });
}

fn benchmark_threshold_shedding(c: &mut Criterion) {
    c.bench_function("sink_threshold_100_shedding_1000", |b| {
        let sink = sink_with(Arc::new(QueueThresholdPredicate::new(100)));
        b.iter(|| {
            let mut accepted = 0;
            for i in 0..1000u64 {
                if sink.enqueue_lossy(black_box(i)) {
                    accepted += 1;
                }
            }
            black_box(sink.queue().dequeue_all());
            accepted
        });
    });
}

fn benchmark_token_bucket(c: &mut Criterion) {
    c.bench_function("sink_token_bucket_1000", |b| {
        let sink = sink_with(Arc::new(RateLimitingPredicate::new(1_000_000.0, 500)));
        b.iter(|| {
            for i in 0..1000u64 {
                let _ = sink.enqueue_lossy(black_box(i));
            }
            black_box(sink.queue().dequeue_all());
        });
    });
}

fn benchmark_batch_enqueue(c: &mut Criterion) {
    c.bench_function("sink_enqueue_many_10x100", |b| {
        let sink = sink_with(Arc::new(QueueThresholdPredicate::new(0)));
        b.iter(|| {
            for chunk in 0..10u64 {
                let batch: Vec<u64> = (chunk * 100..(chunk + 1) * 100).collect();
                let _ = sink.enqueue_many(black_box(batch));
            }
            black_box(sink.queue().dequeue_all());
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(5));
    targets = benchmark_raw_queue, benchmark_accept_all, benchmark_threshold_shedding,
        benchmark_token_bucket, benchmark_batch_enqueue
);
criterion_main!(benches);
