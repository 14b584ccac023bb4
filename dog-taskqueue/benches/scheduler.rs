//! Criterion benchmarks for lane scheduling and the queue facade.
//!
//! Run with: cargo bench

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};

use dog_taskqueue::{
    JobId, PriorityScheduler, PriorityTier, QueueConfig, RateLimitConfig, SubmitRequest, TaskQueue,
};

const TIERS: [PriorityTier; 3] = [PriorityTier::High, PriorityTier::Medium, PriorityTier::Low];

fn filled_scheduler(size: usize) -> PriorityScheduler {
    let scheduler = PriorityScheduler::default();
    for i in 0..size {
        scheduler.submit(JobId::from(format!("job-{}", i)), TIERS[i % 3]);
    }
    scheduler
}

/// Queue with admission limits out of the way
fn unlimited_queue() -> TaskQueue<u64> {
    let config = QueueConfig {
        rate_limit: RateLimitConfig {
            window_seconds: 60,
            max_requests_per_window: u32::MAX,
        },
        ..QueueConfig::default()
    };
    TaskQueue::new(config).unwrap()
}

fn bench_scheduler_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_drain");

    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || filled_scheduler(size),
                |scheduler| {
                    while let Some(job_id) = scheduler.next() {
                        black_box(job_id);
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_scheduler_skewed(c: &mut Criterion) {
    // Only the LOW lane has work, so every pick rolls over
    c.bench_function("scheduler_low_only", |b| {
        b.iter_batched(
            || {
                let scheduler = PriorityScheduler::default();
                for i in 0..1_000 {
                    scheduler.submit(JobId::from(format!("low-{}", i)), PriorityTier::Low);
                }
                scheduler
            },
            |scheduler| {
                while let Some(job_id) = scheduler.next() {
                    black_box(job_id);
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_queue_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_lifecycle");

    for size in [100u64, 1_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                unlimited_queue,
                |queue| {
                    for i in 0..size {
                        let request = SubmitRequest::new(i, "bench").with_tier(TIERS[(i % 3) as usize]);
                        queue.submit(request).unwrap();
                    }
                    while let Some(job) = queue.dequeue_for_worker() {
                        queue.report_success(&job.job_id).unwrap();
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_dependency_chain(c: &mut Criterion) {
    c.bench_function("queue_dependency_chain_500", |b| {
        b.iter_batched(
            || {
                let queue = unlimited_queue();
                let mut previous: Option<JobId> = None;
                for i in 0..500u64 {
                    let mut request = SubmitRequest::new(i, "bench").with_job_id(format!("step-{}", i));
                    if let Some(dep) = previous.take() {
                        request = request.depends_on(dep);
                    }
                    previous = Some(queue.submit(request).unwrap());
                }
                queue
            },
            |queue| {
                while let Some(job) = queue.dequeue_for_worker() {
                    queue.report_success(&job.job_id).unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_scheduler_drain,
    bench_scheduler_skewed,
    bench_queue_lifecycle,
    bench_dependency_chain
);
criterion_main!(benches);
