//! Branch-aware event storage.
//!
//! Each workflow run owns a tree of history branches. Exactly one branch is
//! *current* (the one readers see); non-current branches are retained for
//! audit and reset, never deleted.

pub mod file;
pub mod memory;
pub mod segment;
pub mod sidecar;

use crate::constants::FIRST_EVENT_ID;
use crate::error::{HistError, Result};
use crate::types::{HistoryEvent, WorkflowExecution};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

/// Identifier of a history branch within one run.
pub type BranchId = u64;

/// Branch id given to the root branch of every run.
pub const ROOT_BRANCH_ID: BranchId = 1;

/// Tip of a branch: last event id and version along its lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchTip {
  pub event_id: u64,
  pub version: u64,
}

/// Branch metadata surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
  pub branch_id: BranchId,
  pub parent: Option<BranchId>,
  pub fork_event_id: Option<u64>,
  pub tip_event_id: u64,
  pub tip_version: u64,
  pub last_writer: String,
  pub current: bool,
}

/// Branch-aware append-only event storage for workflow histories.
///
/// `append` is all-or-nothing: a partial append is never observable.
pub trait EventStore: Send + Sync {
  /// Create a run with its root branch. Fails if the run already exists.
  fn register_run(&self, execution: &WorkflowExecution, writer: &str) -> Result<BranchId>;

  fn run_exists(&self, execution: &WorkflowExecution) -> bool;

  /// Append events to a branch tip. Events must be contiguous with the tip
  /// and version-monotonic within the branch's own events.
  fn append(
    &self,
    execution: &WorkflowExecution,
    branch: BranchId,
    events: &[HistoryEvent],
    writer: &str,
  ) -> Result<()>;

  /// Fork a new branch at `fork_event_id` along `parent`'s lineage.
  fn fork(
    &self,
    execution: &WorkflowExecution,
    parent: BranchId,
    fork_event_id: u64,
  ) -> Result<BranchId>;

  fn tip(&self, execution: &WorkflowExecution, branch: BranchId) -> Result<BranchTip>;

  fn current_branch(&self, execution: &WorkflowExecution) -> Result<BranchId>;

  fn set_current_branch(&self, execution: &WorkflowExecution, branch: BranchId) -> Result<()>;

  /// Ordered events of the current branch, root to tip.
  fn history(&self, execution: &WorkflowExecution) -> Result<Vec<HistoryEvent>>;

  /// Lineage-resolved events of `branch` with ids in `[first, last]`,
  /// clipped to what exists.
  fn events_in_range(
    &self,
    execution: &WorkflowExecution,
    branch: BranchId,
    first: u64,
    last: u64,
  ) -> Result<Vec<HistoryEvent>>;

  fn branch_info(&self, execution: &WorkflowExecution, branch: BranchId) -> Result<BranchInfo>;

  fn branches(&self, execution: &WorkflowExecution) -> Result<Vec<BranchInfo>>;
}

// ==========================================================================
// Shared in-memory branch model
// ==========================================================================

#[derive(Debug, Clone)]
pub(crate) struct Branch {
  pub(crate) parent: Option<BranchId>,
  pub(crate) fork_event_id: Option<u64>,
  pub(crate) fork_version: u64,
  pub(crate) events: Vec<HistoryEvent>,
  pub(crate) last_writer: String,
}

impl Branch {
  fn root(writer: &str) -> Self {
    Self {
      parent: None,
      fork_event_id: None,
      fork_version: 0,
      events: Vec::new(),
      last_writer: writer.to_string(),
    }
  }

  pub(crate) fn tip(&self) -> BranchTip {
    match self.events.last() {
      Some(event) => BranchTip {
        event_id: event.event_id,
        version: event.version,
      },
      None => BranchTip {
        event_id: self.fork_event_id.unwrap_or(0),
        version: self.fork_version,
      },
    }
  }
}

/// Branch tree of one run. Both store implementations share this model; the
/// durable store layers persistence on top of it.
#[derive(Debug, Clone)]
pub(crate) struct RunState {
  pub(crate) branches: HashMap<BranchId, Branch>,
  pub(crate) current: BranchId,
  pub(crate) next_branch_id: BranchId,
}

impl RunState {
  pub(crate) fn new_root(writer: &str) -> Self {
    let mut branches = HashMap::new();
    branches.insert(ROOT_BRANCH_ID, Branch::root(writer));
    Self {
      branches,
      current: ROOT_BRANCH_ID,
      next_branch_id: ROOT_BRANCH_ID + 1,
    }
  }

  fn branch(&self, execution: &WorkflowExecution, id: BranchId) -> Result<&Branch> {
    self.branches.get(&id).ok_or_else(|| HistError::UnknownBranch {
      execution: execution.to_string(),
      branch: id,
    })
  }

  pub(crate) fn tip(&self, execution: &WorkflowExecution, id: BranchId) -> Result<BranchTip> {
    Ok(self.branch(execution, id)?.tip())
  }

  pub(crate) fn validate_append(
    &self,
    execution: &WorkflowExecution,
    id: BranchId,
    events: &[HistoryEvent],
  ) -> Result<()> {
    if events.is_empty() {
      return Err(HistError::HistoryCorrupted {
        execution: execution.to_string(),
        reason: "append of empty event slice".to_string(),
      });
    }

    let branch = self.branch(execution, id)?;
    let mut expected_id = branch.tip().event_id + 1;
    // The floor is the branch's own last event, not the fork point: a branch
    // retaining a superseded lineage legitimately carries a lower version
    // than the events it forked from.
    let mut floor_version = branch.events.last().map_or(0, |event| event.version);
    for event in events {
      if event.event_id != expected_id {
        return Err(HistError::HistoryCorrupted {
          execution: execution.to_string(),
          reason: format!(
            "non-contiguous append: expected event {expected_id}, got {}",
            event.event_id
          ),
        });
      }
      if event.version < floor_version {
        return Err(HistError::HistoryCorrupted {
          execution: execution.to_string(),
          reason: format!(
            "version regression at event {}: {} after {}",
            event.event_id, event.version, floor_version
          ),
        });
      }
      expected_id += 1;
      floor_version = event.version;
    }
    Ok(())
  }

  pub(crate) fn append(
    &mut self,
    execution: &WorkflowExecution,
    id: BranchId,
    events: &[HistoryEvent],
    writer: &str,
  ) -> Result<()> {
    self.validate_append(execution, id, events)?;

    let branch = self.branches.get_mut(&id).ok_or_else(|| HistError::UnknownBranch {
      execution: execution.to_string(),
      branch: id,
    })?;
    branch.events.extend_from_slice(events);
    branch.last_writer = writer.to_string();
    Ok(())
  }

  pub(crate) fn fork(
    &mut self,
    execution: &WorkflowExecution,
    parent: BranchId,
    fork_event_id: u64,
  ) -> Result<BranchId> {
    let parent_tip = self.branch(execution, parent)?.tip();
    if fork_event_id > parent_tip.event_id {
      return Err(HistError::HistoryCorrupted {
        execution: execution.to_string(),
        reason: format!(
          "fork point {fork_event_id} beyond branch {parent} tip {}",
          parent_tip.event_id
        ),
      });
    }

    let fork_version = self.version_at(execution, parent, fork_event_id)?;
    let last_writer = self.branch(execution, parent)?.last_writer.clone();
    let id = self.next_branch_id;
    self.next_branch_id += 1;
    self.branches.insert(
      id,
      Branch {
        parent: Some(parent),
        fork_event_id: Some(fork_event_id),
        fork_version,
        events: Vec::new(),
        last_writer,
      },
    );
    Ok(id)
  }

  pub(crate) fn set_current(
    &mut self,
    execution: &WorkflowExecution,
    id: BranchId,
  ) -> Result<()> {
    self.branch(execution, id)?;
    self.current = id;
    Ok(())
  }

  /// Version of the lineage event at `event_id`; 0 addresses the point
  /// before any event.
  pub(crate) fn version_at(
    &self,
    execution: &WorkflowExecution,
    id: BranchId,
    event_id: u64,
  ) -> Result<u64> {
    if event_id == 0 {
      return Ok(0);
    }
    let events = self.events_in_range(execution, id, event_id, event_id)?;
    match events.first() {
      Some(event) => Ok(event.version),
      None => Err(HistError::HistoryCorrupted {
        execution: execution.to_string(),
        reason: format!("no lineage event {event_id} on branch {id}"),
      }),
    }
  }

  pub(crate) fn events_in_range(
    &self,
    execution: &WorkflowExecution,
    id: BranchId,
    first: u64,
    last: u64,
  ) -> Result<Vec<HistoryEvent>> {
    let mut collected = Vec::new();
    self.collect_lineage(execution, id, first, last, &mut collected)?;
    Ok(collected)
  }

  fn collect_lineage(
    &self,
    execution: &WorkflowExecution,
    id: BranchId,
    first: u64,
    last: u64,
    into: &mut Vec<HistoryEvent>,
  ) -> Result<()> {
    if first > last {
      return Ok(());
    }

    let branch = self.branch(execution, id)?;
    if let (Some(parent), Some(fork_event_id)) = (branch.parent, branch.fork_event_id) {
      self.collect_lineage(execution, parent, first, last.min(fork_event_id), into)?;
    }

    into.extend(
      branch
        .events
        .iter()
        .filter(|event| event.event_id >= first && event.event_id <= last)
        .cloned(),
    );
    Ok(())
  }

  pub(crate) fn history(&self, execution: &WorkflowExecution) -> Result<Vec<HistoryEvent>> {
    let tip = self.tip(execution, self.current)?;
    self.events_in_range(execution, self.current, FIRST_EVENT_ID, tip.event_id)
  }

  pub(crate) fn info(
    &self,
    execution: &WorkflowExecution,
    id: BranchId,
  ) -> Result<BranchInfo> {
    let branch = self.branch(execution, id)?;
    let tip = branch.tip();
    Ok(BranchInfo {
      branch_id: id,
      parent: branch.parent,
      fork_event_id: branch.fork_event_id,
      tip_event_id: tip.event_id,
      tip_version: tip.version,
      last_writer: branch.last_writer.clone(),
      current: id == self.current,
    })
  }

  pub(crate) fn infos(&self, execution: &WorkflowExecution) -> Result<Vec<BranchInfo>> {
    let mut ids: Vec<BranchId> = self.branches.keys().copied().collect();
    ids.sort_unstable();
    ids
      .into_iter()
      .map(|id| self.info(execution, id))
      .collect()
  }
}
