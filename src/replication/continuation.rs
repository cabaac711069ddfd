//! Continue-as-new lineage linking.
//!
//! Parent and successor runs are connected through an explicit table keyed
//! by execution; run records never embed back-references to each other.

use crate::types::WorkflowExecution;
use hashbrown::HashMap;
use parking_lot::RwLock;

/// Parent/child edges of one run within a workflow chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunLineage {
  pub parent_run_id: Option<String>,
  pub child_run_ids: Vec<String>,
}

#[derive(Debug, Default)]
pub struct LineageTable {
  links: RwLock<HashMap<WorkflowExecution, RunLineage>>,
}

impl LineageTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record the parent → child edge for a continuation. Idempotent under
  /// redelivery.
  pub fn record_continuation(&self, parent: &WorkflowExecution, child_run_id: &str) {
    let mut links = self.links.write();

    let parent_entry = links.entry(parent.clone()).or_default();
    if !parent_entry
      .child_run_ids
      .iter()
      .any(|existing| existing == child_run_id)
    {
      parent_entry.child_run_ids.push(child_run_id.to_string());
    }

    let child = parent.with_run(child_run_id);
    links.entry(child).or_default().parent_run_id = Some(parent.run_id.clone());
  }

  /// Lineage edges recorded for an execution.
  pub fn lineage(&self, execution: &WorkflowExecution) -> RunLineage {
    self
      .links
      .read()
      .get(execution)
      .cloned()
      .unwrap_or_default()
  }
}
