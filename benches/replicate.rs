use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use histdb::{
  ApplyMode, EventBatch, EventType, HistoryEvent, HistoryReplicator, MemoryEventStore,
  ReplicatorOptions, WorkflowExecution,
};

const BATCHES: u64 = 64;
const EVENTS_PER_BATCH: u64 = 8;

fn build_batches() -> Vec<EventBatch> {
  (0..BATCHES)
    .map(|index| {
      let first = index * EVENTS_PER_BATCH + 1;
      let events: Vec<HistoryEvent> = (first..first + EVENTS_PER_BATCH)
        .map(|id| {
          let event_type = if id == 1 {
            EventType::WorkflowExecutionStarted
          } else {
            EventType::ActivityTaskScheduled
          };
          HistoryEvent::new(id, event_type, 100)
        })
        .collect();
      EventBatch::new(first, 100, "active", events)
    })
    .collect()
}

fn replicator() -> HistoryReplicator {
  HistoryReplicator::new(
    Arc::new(MemoryEventStore::new()),
    ReplicatorOptions::new()
      .cluster_name("standby")
      .known_cluster("active"),
  )
  .expect("replicator")
}

fn bench_apply_in_order(c: &mut Criterion) {
  let batches = build_batches();
  let mut group = c.benchmark_group("replication");
  group.throughput(Throughput::Elements(BATCHES * EVENTS_PER_BATCH));

  group.bench_function("apply_in_order", |b| {
    b.iter_batched(
      || (replicator(), batches.clone()),
      |(replicator, batches)| {
        let execution = WorkflowExecution::new("bench-domain", "bench-workflow", "bench-run");
        for batch in batches {
          replicator
            .apply_batch(&execution, batch, ApplyMode::Normal)
            .expect("apply");
        }
      },
      BatchSize::SmallInput,
    )
  });

  group.bench_function("apply_reversed", |b| {
    b.iter_batched(
      || {
        let mut reversed = batches.clone();
        reversed.reverse();
        (replicator_with_capacity(BATCHES as usize), reversed)
      },
      |(replicator, batches)| {
        let execution = WorkflowExecution::new("bench-domain", "bench-workflow", "bench-run");
        for batch in batches {
          replicator
            .apply_batch(&execution, batch, ApplyMode::Normal)
            .expect("apply");
        }
      },
      BatchSize::SmallInput,
    )
  });

  group.finish();
}

fn replicator_with_capacity(capacity: usize) -> HistoryReplicator {
  HistoryReplicator::new(
    Arc::new(MemoryEventStore::new()),
    ReplicatorOptions::new()
      .cluster_name("standby")
      .known_cluster("active")
      .buffer_capacity(capacity),
  )
  .expect("replicator")
}

criterion_group!(benches, bench_apply_in_order);
criterion_main!(benches);
