//! Batch classification against the current branch tip.

use crate::error::{HistError, Result};
use crate::replication::types::EventBatch;
use crate::store::EventStore;
use crate::types::WorkflowExecution;

/// Decision for one incoming batch given local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
  /// Fully covered by identical stored events.
  Duplicate,
  /// Contiguous with the tip; append as-is.
  Append,
  /// Identical overlapping prefix already stored; append from
  /// `from_event_id` onward.
  AppendTrimmed { from_event_id: u64 },
  /// Gap before the batch; hold until the predecessor arrives.
  OutOfOrder,
  /// Version disagreement in the overlapping range; needs branch
  /// reconciliation.
  Conflict,
}

/// Classify `batch` against the execution's current branch.
///
/// Same-version content divergence is a consistency violation and fails with
/// `HistoryCorrupted`; it is never silently accepted.
pub fn classify(
  store: &dyn EventStore,
  execution: &WorkflowExecution,
  batch: &EventBatch,
) -> Result<Classification> {
  let current = store.current_branch(execution)?;
  let tip = store.tip(execution, current)?;

  if batch.first_event_id > tip.event_id + 1 {
    return Ok(Classification::OutOfOrder);
  }

  if batch.first_event_id == tip.event_id + 1 {
    if batch.version >= tip.version {
      return Ok(Classification::Append);
    }
    // A superseded cluster still writing at the old tip.
    return Ok(Classification::Conflict);
  }

  let last_overlap = (batch.next_event_id - 1).min(tip.event_id);
  let stored = store.events_in_range(execution, current, batch.first_event_id, last_overlap)?;
  let overlap_len = (last_overlap + 1 - batch.first_event_id) as usize;
  if stored.len() != overlap_len {
    return Err(HistError::HistoryCorrupted {
      execution: execution.to_string(),
      reason: format!(
        "lineage hole below tip: {} of {overlap_len} events present in [{}, {last_overlap}]",
        stored.len(),
        batch.first_event_id
      ),
    });
  }

  let incoming = &batch.events[..overlap_len];
  if stored.iter().zip(incoming).any(|(ours, theirs)| ours.version != theirs.version) {
    return Ok(Classification::Conflict);
  }

  if stored.iter().zip(incoming).all(|(ours, theirs)| ours == theirs) {
    if batch.next_event_id <= tip.event_id + 1 {
      return Ok(Classification::Duplicate);
    }
    // A widened retry: the sender resent already-applied events together
    // with their successors.
    return Ok(Classification::AppendTrimmed {
      from_event_id: tip.event_id + 1,
    });
  }

  Err(HistError::HistoryCorrupted {
    execution: execution.to_string(),
    reason: format!(
      "same-version content divergence in [{}, {last_overlap}] from {}",
      batch.first_event_id, batch.source_cluster
    ),
  })
}
