//! Divergent-branch reconciliation.
//!
//! Handles the "same event id range, different version" case: locate the
//! fork point shared by both lineages, rehome the incoming events onto a new
//! branch there, and decide which lineage owns the current pointer.

use crate::error::{HistError, Result};
use crate::replication::types::{ApplyOutcome, EventBatch};
use crate::store::{BranchId, EventStore};
use crate::types::WorkflowExecution;
use tracing::{info, warn};

/// Reconcile a conflicting batch. Returns the outcome and the branch that
/// received the incoming events.
pub fn resolve(
  store: &dyn EventStore,
  execution: &WorkflowExecution,
  batch: &EventBatch,
) -> Result<(ApplyOutcome, BranchId)> {
  let current = store.current_branch(execution)?;
  let tip = store.tip(execution, current)?;

  let fork_event_id = fork_point(store, execution, current, batch)?;
  let suffix: Vec<_> = batch
    .events
    .iter()
    .filter(|event| event.event_id > fork_event_id)
    .cloned()
    .collect();
  if suffix.is_empty() {
    // Everything the batch carries is already part of the lineage.
    return Ok((ApplyOutcome::Duplicate, current));
  }

  // A retried batch whose lineage is already retained must not fork again.
  let already_retained = store.branches(execution)?.into_iter().any(|info| {
    info.fork_event_id == Some(fork_event_id)
      && info.tip_event_id + 1 == batch.next_event_id
      && info.tip_version == batch.version
      && info.last_writer == batch.source_cluster
  });
  if already_retained {
    return Ok((ApplyOutcome::ConflictResolved { took_over: false }, current));
  }

  let took_over = if batch.version > tip.version {
    true
  } else if batch.version < tip.version {
    false
  } else {
    // Simultaneous failover produced the same version on two clusters;
    // break the tie deterministically by cluster name.
    let local_writer = store.branch_info(execution, current)?.last_writer;
    if batch.source_cluster == local_writer {
      return Err(HistError::ConflictUnresolved {
        execution: execution.to_string(),
        reason: format!(
          "cluster {} produced divergent content at version {}",
          batch.source_cluster, batch.version
        ),
      });
    }
    batch.source_cluster > local_writer
  };

  let branch = store.fork(execution, current, fork_event_id)?;
  store.append(execution, branch, &suffix, &batch.source_cluster)?;

  if took_over {
    store.set_current_branch(execution, branch)?;
    info!(
      execution = %execution,
      branch,
      fork_event_id,
      version = batch.version,
      source = %batch.source_cluster,
      "incoming lineage superseded current branch"
    );
  } else {
    warn!(
      execution = %execution,
      branch,
      fork_event_id,
      version = batch.version,
      source = %batch.source_cluster,
      "stale lineage retained on non-current branch"
    );
  }

  Ok((ApplyOutcome::ConflictResolved { took_over }, branch))
}

/// Last event id shared by the current lineage and the incoming batch:
/// the greatest overlapping id at which both sides agree exactly, or the
/// event just before the batch when they disagree from its start.
pub(crate) fn fork_point(
  store: &dyn EventStore,
  execution: &WorkflowExecution,
  current: BranchId,
  batch: &EventBatch,
) -> Result<u64> {
  let tip = store.tip(execution, current)?;
  if batch.first_event_id > tip.event_id {
    return Ok(tip.event_id);
  }

  let last_overlap = (batch.next_event_id - 1).min(tip.event_id);
  let stored = store.events_in_range(execution, current, batch.first_event_id, last_overlap)?;

  let mut fork = batch.first_event_id - 1;
  for (ours, theirs) in stored.iter().zip(&batch.events) {
    if ours != theirs {
      break;
    }
    fork = ours.event_id;
  }
  Ok(fork)
}

#[cfg(test)]
mod tests {
  use super::resolve;
  use crate::error::HistError;
  use crate::replication::types::{ApplyOutcome, EventBatch};
  use crate::store::memory::MemoryEventStore;
  use crate::store::EventStore;
  use crate::types::{EventType, HistoryEvent, WorkflowExecution};

  fn seeded_store(execution: &WorkflowExecution) -> MemoryEventStore {
    let store = MemoryEventStore::new();
    let root = store.register_run(execution, "cluster-b").expect("register");
    let events: Vec<HistoryEvent> = (1..=5)
      .map(|id| HistoryEvent::new(id, EventType::ActivityTaskScheduled, 100))
      .collect();
    store
      .append(execution, root, &events, "cluster-b")
      .expect("append");
    store
  }

  fn divergent_batch(first: u64, count: u64, version: u64, source: &str) -> EventBatch {
    let events: Vec<HistoryEvent> = (first..first + count)
      .map(|id| HistoryEvent::new(id, EventType::TimerStarted, version))
      .collect();
    EventBatch::new(first, version, source, events)
  }

  #[test]
  fn newer_version_takes_over_current() {
    let execution = WorkflowExecution::new("d", "w", "r");
    let store = seeded_store(&execution);

    let batch = divergent_batch(4, 3, 200, "cluster-a");
    let (outcome, branch) = resolve(&store, &execution, &batch).expect("resolve");
    assert_eq!(outcome, ApplyOutcome::ConflictResolved { took_over: true });

    assert_eq!(store.current_branch(&execution).expect("current"), branch);
    let history = store.history(&execution).expect("history");
    let ids: Vec<u64> = history.iter().map(|event| event.event_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(history[3].version, 200);

    // Old lineage retained, non-current.
    let branches = store.branches(&execution).expect("branches");
    assert_eq!(branches.len(), 2);
    assert!(branches.iter().any(|info| !info.current && info.tip_version == 100));
  }

  #[test]
  fn stale_version_is_retained_off_current() {
    let execution = WorkflowExecution::new("d", "w", "r");
    let store = seeded_store(&execution);

    let batch = divergent_batch(4, 2, 50, "cluster-a");
    let (outcome, branch) = resolve(&store, &execution, &batch).expect("resolve");
    assert_eq!(outcome, ApplyOutcome::ConflictResolved { took_over: false });
    assert_ne!(store.current_branch(&execution).expect("current"), branch);

    let history = store.history(&execution).expect("history");
    assert_eq!(history.len(), 5);
    assert!(history.iter().all(|event| event.version == 100));

    let info = store.branch_info(&execution, branch).expect("info");
    assert_eq!(info.fork_event_id, Some(3));
    assert_eq!(info.tip_version, 50);

    // Redelivery of the same stale batch does not fork again.
    let (outcome, _) = resolve(&store, &execution, &batch).expect("redeliver");
    assert_eq!(outcome, ApplyOutcome::ConflictResolved { took_over: false });
    assert_eq!(store.branches(&execution).expect("branches").len(), 2);
  }

  #[test]
  fn equal_version_tie_breaks_by_cluster_name() {
    let execution = WorkflowExecution::new("d", "w", "r");

    // "cluster-c" sorts after the local writer "cluster-b": incoming wins.
    let store = seeded_store(&execution);
    let winning = divergent_batch(4, 2, 100, "cluster-c");
    let (outcome, branch) = resolve(&store, &execution, &winning).expect("resolve");
    assert_eq!(outcome, ApplyOutcome::ConflictResolved { took_over: true });
    assert_eq!(store.current_branch(&execution).expect("current"), branch);

    // "cluster-a" sorts before it: incoming is retained but loses.
    let store = seeded_store(&execution);
    let losing = divergent_batch(4, 2, 100, "cluster-a");
    let (outcome, branch) = resolve(&store, &execution, &losing).expect("resolve");
    assert_eq!(outcome, ApplyOutcome::ConflictResolved { took_over: false });
    assert_ne!(store.current_branch(&execution).expect("current"), branch);
  }

  #[test]
  fn same_writer_divergence_is_unresolved() {
    let execution = WorkflowExecution::new("d", "w", "r");
    let store = seeded_store(&execution);

    let batch = divergent_batch(4, 2, 100, "cluster-b");
    match resolve(&store, &execution, &batch) {
      Err(HistError::ConflictUnresolved { .. }) => {}
      other => panic!("expected unresolved conflict, got {other:?}"),
    }
  }

  #[test]
  fn fork_lands_after_shared_prefix() {
    let execution = WorkflowExecution::new("d", "w", "r");
    let store = seeded_store(&execution);

    // First two overlapping events agree with local history, the third
    // diverges: fork must land at event 4.
    let mut batch = divergent_batch(3, 3, 200, "cluster-a");
    batch.events[0] = HistoryEvent::new(3, EventType::ActivityTaskScheduled, 100);
    batch.events[1] = HistoryEvent::new(4, EventType::ActivityTaskScheduled, 100);

    let (outcome, branch) = resolve(&store, &execution, &batch).expect("resolve");
    assert_eq!(outcome, ApplyOutcome::ConflictResolved { took_over: true });

    let info = store.branch_info(&execution, branch).expect("info");
    assert_eq!(info.fork_event_id, Some(4));

    let history = store.history(&execution).expect("history");
    let ids: Vec<u64> = history.iter().map(|event| event.event_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(history[4].version, 200);
  }
}
