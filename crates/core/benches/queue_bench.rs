//! Queue and Feedback Benchmarks
//!
//! ## Benchmark Categories
//!
//! ### 1. Queue Push/Pop (`queue_push_pop`)
//! **What it measures**: One push plus one strict-priority pop, per tier
//! **Importance**: Sits on every submission and every worker pull
//!
//! ### 2. Mixed Drain (`queue_mixed_drain`)
//! **What it measures**: Draining a queue filled across all five tiers
//! **Importance**: Worst case for the tier scan
//!
//! ### 3. Feedback Score (`feedback_score`)
//! **What it measures**: Adaptation score over a full window
//! **Importance**: Computed on every monitor tick
//!
//! ### 4. End-to-end Round Trip (`engine_round_trip`)
//! **What it measures**: Submit plus blocking `get_result` on a running engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use std::time::Duration;

use serde_json::{json, Value};

use flowgate_core::config::{EngineConfig, FeedbackConfig, QueueCapacity};
use flowgate_core::engine::{
    Engine, PerformanceFeedbackModel, PriorityQueueSet, ScheduledTask, Task, TaskPriority,
};
use flowgate_core::types::TaskId;

fn noop_task(priority: TaskPriority) -> Task {
    Task::from_fn(json!({"n": 1}), |_, _| Ok(Value::Null)).with_priority(priority)
}

/// Benchmark single push/pop per tier
#[allow(clippy::unwrap_used)]
fn bench_queue_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_push_pop");
    let queue = PriorityQueueSet::new(QueueCapacity::uniform(1_024)).unwrap();

    for priority in TaskPriority::ALL {
        group.bench_with_input(
            BenchmarkId::from_parameter(priority),
            &priority,
            |b, &priority| {
                b.iter(|| {
                    queue
                        .push(ScheduledTask::new(TaskId::new(), noop_task(priority)))
                        .unwrap();
                    black_box(queue.try_next())
                });
            },
        );
    }

    group.finish();
}

/// Benchmark draining a mixed-tier queue
#[allow(clippy::unwrap_used)]
fn bench_queue_mixed_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_mixed_drain");

    for size in [100_usize, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let queue = PriorityQueueSet::new(QueueCapacity::uniform(size)).unwrap();
                    for n in 0..size {
                        let priority = TaskPriority::ALL[n % TaskPriority::ALL.len()];
                        queue
                            .push(ScheduledTask::new(TaskId::new(), noop_task(priority)))
                            .unwrap();
                    }
                    queue
                },
                |queue| {
                    while let Some(task) = queue.try_next() {
                        black_box(task);
                    }
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark adaptation score over a full window
fn bench_feedback_score(c: &mut Criterion) {
    let model = PerformanceFeedbackModel::new(FeedbackConfig::default());
    for n in 0..1_000_u32 {
        model.record(PerformanceFeedbackModel::features(
            n % 7 != 0,
            Duration::from_micros(u64::from(n)),
            128,
            TaskPriority::Normal.normalized(),
            0.5,
        ));
    }

    c.bench_function("feedback_score", |b| b.iter(|| black_box(model.score())));
}

/// Benchmark submit plus result retrieval
#[allow(clippy::unwrap_used)]
fn bench_engine_round_trip(c: &mut Criterion) {
    let mut engine = Engine::new(EngineConfig::test()).unwrap();
    engine.start().unwrap();

    c.bench_function("engine_round_trip", |b| {
        b.iter(|| {
            let id = engine.submit(noop_task(TaskPriority::High)).unwrap();
            black_box(engine.get_result(&id, Duration::from_secs(5)))
        });
    });

    engine.stop().unwrap();
}

criterion_group!(
    benches,
    bench_queue_push_pop,
    bench_queue_mixed_drain,
    bench_feedback_score,
    bench_engine_round_trip
);

criterion_main!(benches);
