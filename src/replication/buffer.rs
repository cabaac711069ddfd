//! Out-of-order batch buffering.
//!
//! Premature batches are held per execution, keyed by the event id they wait
//! for, and drained by the ingress once the tip catches up. Capacity is the
//! backpressure bound; age only drives observability, entries are never
//! dropped.

use crate::error::{HistError, Result};
use crate::replication::types::EventBatch;
use crate::types::WorkflowExecution;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct BufferedEntry {
  batch: EventBatch,
  new_run: Option<EventBatch>,
  buffered_at: Instant,
}

/// Status row for one pending batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedBatchStatus {
  pub execution: WorkflowExecution,
  pub first_event_id: u64,
  pub next_event_id: u64,
  pub version: u64,
  pub age: Duration,
  pub stuck: bool,
}

#[derive(Debug)]
pub struct BufferManager {
  capacity: usize,
  age_horizon: Duration,
  pending: Mutex<HashMap<WorkflowExecution, BTreeMap<u64, BufferedEntry>>>,
}

impl BufferManager {
  pub fn new(capacity: usize, age_horizon: Duration) -> Self {
    Self {
      capacity,
      age_horizon,
      pending: Mutex::new(HashMap::new()),
    }
  }

  /// Hold a batch until its predecessor arrives. A retry of an already
  /// buffered batch replaces the held entry and does not count against
  /// capacity.
  pub fn put(
    &self,
    execution: &WorkflowExecution,
    batch: EventBatch,
    new_run: Option<EventBatch>,
  ) -> Result<()> {
    let mut pending = self.pending.lock();
    let slot = pending.entry(execution.clone()).or_default();

    if !slot.contains_key(&batch.first_event_id) && slot.len() >= self.capacity {
      return Err(HistError::BufferOverflow {
        execution: execution.to_string(),
        capacity: self.capacity,
      });
    }

    slot.insert(
      batch.first_event_id,
      BufferedEntry {
        batch,
        new_run,
        buffered_at: Instant::now(),
      },
    );
    Ok(())
  }

  /// Remove and return the batch waiting for `first_event_id`, if any.
  pub fn take(
    &self,
    execution: &WorkflowExecution,
    first_event_id: u64,
  ) -> Option<(EventBatch, Option<EventBatch>)> {
    let mut pending = self.pending.lock();
    let slot = pending.get_mut(execution)?;
    let entry = slot.remove(&first_event_id)?;
    if slot.is_empty() {
      pending.remove(execution);
    }
    Some((entry.batch, entry.new_run))
  }

  pub fn pending_count(&self, execution: &WorkflowExecution) -> usize {
    self
      .pending
      .lock()
      .get(execution)
      .map_or(0, |slot| slot.len())
  }

  /// All pending batches, oldest first, with stuck-replication flags.
  pub fn status(&self) -> Vec<BufferedBatchStatus> {
    let pending = self.pending.lock();
    let now = Instant::now();
    let mut rows: Vec<BufferedBatchStatus> = pending
      .iter()
      .flat_map(|(execution, slot)| {
        slot.values().map(|entry| {
          let age = now.saturating_duration_since(entry.buffered_at);
          BufferedBatchStatus {
            execution: execution.clone(),
            first_event_id: entry.batch.first_event_id,
            next_event_id: entry.batch.next_event_id,
            version: entry.batch.version,
            age,
            stuck: age >= self.age_horizon,
          }
        })
      })
      .collect();
    rows.sort_by(|left, right| right.age.cmp(&left.age));
    rows
  }
}
