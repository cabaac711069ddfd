//! In-memory branch-aware event store.

use super::{BranchId, BranchInfo, BranchTip, EventStore, RunState};
use crate::error::{HistError, Result};
use crate::types::{HistoryEvent, WorkflowExecution};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Primary in-process `EventStore` implementation.
///
/// The run map is locked only for lookup and registration; each run mutates
/// under its own lock so unrelated executions never contend.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
  runs: RwLock<HashMap<WorkflowExecution, Arc<Mutex<RunState>>>>,
}

impl MemoryEventStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_run<T>(
    &self,
    execution: &WorkflowExecution,
    f: impl FnOnce(&mut RunState) -> Result<T>,
  ) -> Result<T> {
    let run = self
      .runs
      .read()
      .get(execution)
      .cloned()
      .ok_or_else(|| HistError::UnknownExecution(execution.to_string()))?;
    let mut run = run.lock();
    f(&mut run)
  }
}

impl EventStore for MemoryEventStore {
  fn register_run(&self, execution: &WorkflowExecution, writer: &str) -> Result<BranchId> {
    let mut runs = self.runs.write();
    if runs.contains_key(execution) {
      return Err(HistError::InvalidReplication(format!(
        "run already registered: {execution}"
      )));
    }
    let run = RunState::new_root(writer);
    let root = run.current;
    runs.insert(execution.clone(), Arc::new(Mutex::new(run)));
    Ok(root)
  }

  fn run_exists(&self, execution: &WorkflowExecution) -> bool {
    self.runs.read().contains_key(execution)
  }

  fn append(
    &self,
    execution: &WorkflowExecution,
    branch: BranchId,
    events: &[HistoryEvent],
    writer: &str,
  ) -> Result<()> {
    self.with_run(execution, |run| run.append(execution, branch, events, writer))
  }

  fn fork(
    &self,
    execution: &WorkflowExecution,
    parent: BranchId,
    fork_event_id: u64,
  ) -> Result<BranchId> {
    self.with_run(execution, |run| run.fork(execution, parent, fork_event_id))
  }

  fn tip(&self, execution: &WorkflowExecution, branch: BranchId) -> Result<BranchTip> {
    self.with_run(execution, |run| run.tip(execution, branch))
  }

  fn current_branch(&self, execution: &WorkflowExecution) -> Result<BranchId> {
    self.with_run(execution, |run| Ok(run.current))
  }

  fn set_current_branch(&self, execution: &WorkflowExecution, branch: BranchId) -> Result<()> {
    self.with_run(execution, |run| run.set_current(execution, branch))
  }

  fn history(&self, execution: &WorkflowExecution) -> Result<Vec<HistoryEvent>> {
    self.with_run(execution, |run| run.history(execution))
  }

  fn events_in_range(
    &self,
    execution: &WorkflowExecution,
    branch: BranchId,
    first: u64,
    last: u64,
  ) -> Result<Vec<HistoryEvent>> {
    self.with_run(execution, |run| {
      run.events_in_range(execution, branch, first, last)
    })
  }

  fn branch_info(&self, execution: &WorkflowExecution, branch: BranchId) -> Result<BranchInfo> {
    self.with_run(execution, |run| run.info(execution, branch))
  }

  fn branches(&self, execution: &WorkflowExecution) -> Result<Vec<BranchInfo>> {
    self.with_run(execution, |run| run.infos(execution))
  }
}
