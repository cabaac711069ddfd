//! Per-execution serialization and conflict fencing.
//!
//! Every execution gets one exclusive slot; all ingress work for that
//! execution runs under its lock while distinct executions proceed in
//! parallel. The slot also carries the fence raised by an unresolved
//! conflict, which blocks further replication until a reset arrives.

use crate::types::WorkflowExecution;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct ExecutionSlot {
  fence: Option<String>,
}

impl ExecutionSlot {
  pub fn fence_reason(&self) -> Option<&str> {
    self.fence.as_deref()
  }

  pub fn raise_fence(&mut self, reason: impl Into<String>) {
    self.fence = Some(reason.into());
  }

  pub fn clear_fence(&mut self) {
    self.fence = None;
  }
}

#[derive(Debug, Default)]
pub struct ExecutionRegistry {
  slots: RwLock<HashMap<WorkflowExecution, Arc<Mutex<ExecutionSlot>>>>,
}

impl ExecutionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Exclusive slot for one execution, created on first use.
  pub fn slot(&self, execution: &WorkflowExecution) -> Arc<Mutex<ExecutionSlot>> {
    if let Some(slot) = self.slots.read().get(execution) {
      return Arc::clone(slot);
    }

    let mut slots = self.slots.write();
    Arc::clone(
      slots
        .entry(execution.clone())
        .or_insert_with(|| Arc::new(Mutex::new(ExecutionSlot::default()))),
    )
  }

  /// Fence reason for an execution, if one is raised.
  pub fn fence_reason(&self, execution: &WorkflowExecution) -> Option<String> {
    self
      .slots
      .read()
      .get(execution)
      .and_then(|slot| slot.lock().fence_reason().map(str::to_string))
  }
}
