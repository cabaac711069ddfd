//! Replication ingress.
//!
//! Entry point for replicated event batches: validates, serializes per
//! execution, classifies, routes to the store, the conflict resolver or the
//! out-of-order buffer, drains buffered successors after every append, and
//! wires continue-as-new successors.

use crate::config::ReplicatorOptions;
use crate::constants::FIRST_EVENT_ID;
use crate::error::{HistError, Result};
use crate::replication::buffer::{BufferManager, BufferedBatchStatus};
use crate::replication::classifier::{classify, Classification};
use crate::replication::continuation::{LineageTable, RunLineage};
use crate::replication::registry::{ExecutionRegistry, ExecutionSlot};
use crate::replication::resolver;
use crate::replication::types::{
  ApplyMode, ApplyOutcome, EventBatch, ReplicateRequest, ReplicationProgress,
};
use crate::store::{BranchInfo, EventStore};
use crate::types::{HistoryEvent, HistoryPosition, WorkflowExecution};
use hashbrown::HashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Merges replicated history batches into the local event store.
pub struct HistoryReplicator {
  options: ReplicatorOptions,
  store: Arc<dyn EventStore>,
  buffer: BufferManager,
  lineage: LineageTable,
  registry: ExecutionRegistry,
  progress: Mutex<HashMap<WorkflowExecution, IndexMap<String, ReplicationProgress>>>,
}

impl HistoryReplicator {
  pub fn new(store: Arc<dyn EventStore>, options: ReplicatorOptions) -> Result<Self> {
    options.validate()?;
    let buffer = BufferManager::new(options.capacity(), options.age_horizon());
    Ok(Self {
      options,
      store,
      buffer,
      lineage: LineageTable::new(),
      registry: ExecutionRegistry::new(),
      progress: Mutex::new(HashMap::new()),
    })
  }

  pub fn options(&self) -> &ReplicatorOptions {
    &self.options
  }

  pub fn store(&self) -> &Arc<dyn EventStore> {
    &self.store
  }

  /// Apply one replicated batch from the transport layer.
  pub fn replicate_events(&self, request: ReplicateRequest) -> Result<ApplyOutcome> {
    let (execution, batch, new_run, mode) = request.into_parts()?;
    self.apply(&execution, batch, new_run, mode)
  }

  /// Apply one batch directly (embedding entry point).
  pub fn apply_batch(
    &self,
    execution: &WorkflowExecution,
    batch: EventBatch,
    mode: ApplyMode,
  ) -> Result<ApplyOutcome> {
    self.apply(execution, batch, None, mode)
  }

  /// Ordered history of the current branch.
  pub fn history(&self, execution: &WorkflowExecution) -> Result<Vec<HistoryEvent>> {
    self.store.history(execution)
  }

  pub fn branches(&self, execution: &WorkflowExecution) -> Result<Vec<BranchInfo>> {
    self.store.branches(execution)
  }

  /// Version and event id at the current branch tip.
  pub fn applied_position(&self, execution: &WorkflowExecution) -> Result<HistoryPosition> {
    let current = self.store.current_branch(execution)?;
    let tip = self.store.tip(execution, current)?;
    Ok(HistoryPosition::new(tip.version, tip.event_id))
  }

  /// Pending out-of-order batches; stuck entries are logged.
  pub fn buffer_status(&self) -> Vec<BufferedBatchStatus> {
    let rows = self.buffer.status();
    for row in rows.iter().filter(|row| row.stuck) {
      warn!(
        execution = %row.execution,
        first_event_id = row.first_event_id,
        age_ms = row.age.as_millis() as u64,
        "buffered batch exceeds age horizon, replication may be stuck"
      );
    }
    rows
  }

  /// Fence reason if replication for this execution stopped on an
  /// unresolved conflict.
  pub fn conflict_fence(&self, execution: &WorkflowExecution) -> Option<String> {
    self.registry.fence_reason(execution)
  }

  /// Continue-as-new edges recorded for an execution.
  pub fn lineage(&self, execution: &WorkflowExecution) -> RunLineage {
    self.lineage.lineage(execution)
  }

  /// Highest per-cluster progress observed in batches for an execution.
  pub fn observed_progress(
    &self,
    execution: &WorkflowExecution,
  ) -> IndexMap<String, ReplicationProgress> {
    self
      .progress
      .lock()
      .get(execution)
      .cloned()
      .unwrap_or_default()
  }

  fn apply(
    &self,
    execution: &WorkflowExecution,
    batch: EventBatch,
    new_run: Option<EventBatch>,
    mode: ApplyMode,
  ) -> Result<ApplyOutcome> {
    batch.validate()?;
    self.validate_clusters(&batch)?;
    if let Some(new_run) = &new_run {
      new_run.validate()?;
      let continues = batch
        .last_event()
        .is_some_and(|event| event.continued_run_id().is_some());
      if !continues {
        return Err(HistError::InvalidReplication(
          "new-run history without a continuation event carrying the successor run id".to_string(),
        ));
      }
    }

    let slot = self.registry.slot(execution);
    let mut slot = slot.lock();

    if let Some(reason) = slot.fence_reason() {
      if mode != ApplyMode::Reset {
        return Err(HistError::ConflictUnresolved {
          execution: execution.to_string(),
          reason: reason.to_string(),
        });
      }
    }

    self.observe_progress(execution, &batch);

    match mode {
      ApplyMode::ForceBuffer => {
        self.buffer.put(execution, batch, new_run)?;
        debug!(execution = %execution, "batch force-buffered");
        Ok(ApplyOutcome::Buffered)
      }
      ApplyMode::Reset => {
        self.truncate_for_reset(execution, &batch, &mut slot)?;
        self.apply_and_drain(execution, batch, new_run, &mut slot)
      }
      ApplyMode::Normal => self.apply_and_drain(execution, batch, new_run, &mut slot),
    }
  }

  fn apply_and_drain(
    &self,
    execution: &WorkflowExecution,
    batch: EventBatch,
    new_run: Option<EventBatch>,
    slot: &mut ExecutionSlot,
  ) -> Result<ApplyOutcome> {
    let outcome = self.apply_step(execution, batch, new_run, slot)?;
    // A force-buffered predecessor may already match the tip, so drain after
    // every successful call, not only after appends.
    self.drain(execution, slot);
    Ok(outcome)
  }

  /// One classify/apply pass under the execution lock, without draining.
  fn apply_step(
    &self,
    execution: &WorkflowExecution,
    batch: EventBatch,
    new_run: Option<EventBatch>,
    slot: &mut ExecutionSlot,
  ) -> Result<ApplyOutcome> {
    if !self.store.run_exists(execution) {
      if batch.first_event_id != FIRST_EVENT_ID {
        self.buffer.put(execution, batch, new_run)?;
        debug!(execution = %execution, "first batch out of order, buffered");
        return Ok(ApplyOutcome::Buffered);
      }
      self.store.register_run(execution, &batch.source_cluster)?;
      debug!(execution = %execution, source = %batch.source_cluster, "run registered");
    }

    let classification = match classify(self.store.as_ref(), execution, &batch) {
      Ok(classification) => classification,
      Err(error) => return Err(self.fence_on_fatal(execution, slot, error)),
    };

    let outcome = match classification {
      Classification::Duplicate => {
        debug!(execution = %execution, first = batch.first_event_id, "duplicate batch ignored");
        ApplyOutcome::Duplicate
      }
      Classification::Append => {
        let current = self.store.current_branch(execution)?;
        self
          .store
          .append(execution, current, &batch.events, &batch.source_cluster)?;
        debug!(
          execution = %execution,
          first = batch.first_event_id,
          next = batch.next_event_id,
          version = batch.version,
          "batch applied"
        );
        ApplyOutcome::Applied
      }
      Classification::AppendTrimmed { from_event_id } => {
        let current = self.store.current_branch(execution)?;
        let suffix: Vec<HistoryEvent> = batch
          .events
          .iter()
          .filter(|event| event.event_id >= from_event_id)
          .cloned()
          .collect();
        self
          .store
          .append(execution, current, &suffix, &batch.source_cluster)?;
        debug!(
          execution = %execution,
          from = from_event_id,
          next = batch.next_event_id,
          "widened retry applied from trim point"
        );
        ApplyOutcome::Applied
      }
      Classification::OutOfOrder => {
        let first = batch.first_event_id;
        self.buffer.put(execution, batch, new_run)?;
        debug!(execution = %execution, first, "batch buffered until predecessor arrives");
        return Ok(ApplyOutcome::Buffered);
      }
      Classification::Conflict => {
        match resolver::resolve(self.store.as_ref(), execution, &batch) {
          Ok((outcome, _branch)) => outcome,
          Err(error) => return Err(self.fence_on_fatal(execution, slot, error)),
        }
      }
    };

    if applied_to_current(outcome) {
      self.handle_continuation(execution, &batch, new_run)?;
    }
    Ok(outcome)
  }

  /// Apply buffered successors while each newly exposed tip has one waiting.
  fn drain(&self, execution: &WorkflowExecution, slot: &mut ExecutionSlot) {
    loop {
      let next_expected = if self.store.run_exists(execution) {
        match self
          .store
          .current_branch(execution)
          .and_then(|current| self.store.tip(execution, current))
        {
          Ok(tip) => tip.event_id + 1,
          Err(_) => break,
        }
      } else {
        FIRST_EVENT_ID
      };

      let Some((batch, new_run)) = self.buffer.take(execution, next_expected) else {
        break;
      };

      let first = batch.first_event_id;
      match self.apply_step(execution, batch, new_run, slot) {
        Ok(outcome) => {
          debug!(execution = %execution, first, ?outcome, "buffered batch drained");
        }
        Err(error) => {
          warn!(execution = %execution, first, %error, "buffered batch failed to apply");
          break;
        }
      }
    }
  }

  fn handle_continuation(
    &self,
    execution: &WorkflowExecution,
    batch: &EventBatch,
    new_run: Option<EventBatch>,
  ) -> Result<()> {
    let Some(last) = batch.last_event() else {
      return Ok(());
    };
    let Some(child_run_id) = last.continued_run_id() else {
      return Ok(());
    };
    if child_run_id == execution.run_id {
      return Err(HistError::InvalidReplication(format!(
        "continuation points back at its own run: {child_run_id}"
      )));
    }

    self.lineage.record_continuation(execution, child_run_id);
    info!(
      execution = %execution,
      child_run = child_run_id,
      "continuation recorded"
    );

    // Without a payload the successor is reconstructed from its own
    // replicated batches; only the edge is recorded.
    let Some(new_run) = new_run else {
      return Ok(());
    };

    let child = execution.with_run(child_run_id);
    let outcome = self.apply(&child, new_run, None, ApplyMode::Normal)?;
    debug!(execution = %child, ?outcome, "successor run initialized");
    Ok(())
  }

  /// Fork the current branch at the last point shared with the batch and
  /// make the fork current, clearing any conflict fence.
  fn truncate_for_reset(
    &self,
    execution: &WorkflowExecution,
    batch: &EventBatch,
    slot: &mut ExecutionSlot,
  ) -> Result<()> {
    slot.clear_fence();
    if !self.store.run_exists(execution) {
      return Ok(());
    }

    let current = self.store.current_branch(execution)?;
    let fork_event_id = resolver::fork_point(self.store.as_ref(), execution, current, batch)?;
    let branch = self.store.fork(execution, current, fork_event_id)?;
    self.store.set_current_branch(execution, branch)?;
    info!(
      execution = %execution,
      branch,
      fork_event_id,
      "current branch truncated for reset"
    );
    Ok(())
  }

  fn validate_clusters(&self, batch: &EventBatch) -> Result<()> {
    if batch.source_cluster == self.options.local_cluster() {
      return Err(HistError::InvalidReplication(format!(
        "batch source {} is the local cluster",
        batch.source_cluster
      )));
    }
    if !self.options.is_known_cluster(&batch.source_cluster) {
      return Err(HistError::InvalidReplication(format!(
        "unknown source cluster: {}",
        batch.source_cluster
      )));
    }
    for cluster in batch.replication_info.keys() {
      if !self.options.is_known_cluster(cluster) {
        return Err(HistError::InvalidReplication(format!(
          "replication info references unknown cluster: {cluster}"
        )));
      }
    }
    Ok(())
  }

  fn observe_progress(&self, execution: &WorkflowExecution, batch: &EventBatch) {
    if batch.replication_info.is_empty() {
      return;
    }
    let mut progress = self.progress.lock();
    let entry = progress.entry(execution.clone()).or_default();
    for (cluster, incoming) in &batch.replication_info {
      let merged = entry
        .get(cluster)
        .copied()
        .unwrap_or_default()
        .merged(*incoming);
      entry.insert(cluster.clone(), merged);
    }
  }

  fn fence_on_fatal(
    &self,
    execution: &WorkflowExecution,
    slot: &mut ExecutionSlot,
    error: HistError,
  ) -> HistError {
    if matches!(
      error,
      HistError::ConflictUnresolved { .. } | HistError::HistoryCorrupted { .. }
    ) {
      slot.raise_fence(error.to_string());
      warn!(execution = %execution, %error, "replication fenced until reset");
    }
    error
  }
}

fn applied_to_current(outcome: ApplyOutcome) -> bool {
  matches!(
    outcome,
    ApplyOutcome::Applied
      | ApplyOutcome::Duplicate
      | ApplyOutcome::ConflictResolved { took_over: true }
  )
}
