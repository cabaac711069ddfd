//! Replication batch, progress and mode types.

use crate::constants::{FIRST_EVENT_ID, SUPPORTED_EVENT_STORE_VERSION};
use crate::error::{HistError, Result};
use crate::types::{HistoryEvent, WorkflowExecution};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// How far a cluster believes replication has progressed for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReplicationProgress {
  pub version: u64,
  pub last_event_id: u64,
}

impl ReplicationProgress {
  pub const fn new(version: u64, last_event_id: u64) -> Self {
    Self {
      version,
      last_event_id,
    }
  }

  /// Componentwise maximum; progress is monotonically non-decreasing.
  pub fn merged(self, other: Self) -> Self {
    Self {
      version: self.version.max(other.version),
      last_event_id: self.last_event_id.max(other.last_event_id),
    }
  }
}

/// One replicated slice of a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
  pub first_event_id: u64,
  pub next_event_id: u64,
  pub version: u64,
  pub source_cluster: String,
  pub events: Vec<HistoryEvent>,
  #[serde(default)]
  pub replication_info: IndexMap<String, ReplicationProgress>,
}

impl EventBatch {
  pub fn new(
    first_event_id: u64,
    version: u64,
    source_cluster: impl Into<String>,
    events: Vec<HistoryEvent>,
  ) -> Self {
    Self {
      first_event_id,
      next_event_id: first_event_id + events.len() as u64,
      version,
      source_cluster: source_cluster.into(),
      events,
      replication_info: IndexMap::new(),
    }
  }

  pub fn last_event(&self) -> Option<&HistoryEvent> {
    self.events.last()
  }

  /// Structural well-formedness. Malformed batches are rejected outright and
  /// never retried by this layer.
  pub fn validate(&self) -> Result<()> {
    if self.events.is_empty() {
      return Err(HistError::InvalidReplication(
        "batch carries no events".to_string(),
      ));
    }
    if self.first_event_id < FIRST_EVENT_ID {
      return Err(HistError::InvalidReplication(format!(
        "first event id must be at least {FIRST_EVENT_ID}, got {}",
        self.first_event_id
      )));
    }
    let expected_next = self.first_event_id + self.events.len() as u64;
    if self.next_event_id != expected_next {
      return Err(HistError::InvalidReplication(format!(
        "next event id {} disagrees with first {} + {} events",
        self.next_event_id,
        self.first_event_id,
        self.events.len()
      )));
    }
    if self.source_cluster.is_empty() {
      return Err(HistError::InvalidReplication(
        "source cluster must not be empty".to_string(),
      ));
    }

    let mut expected_id = self.first_event_id;
    for event in &self.events {
      if event.event_id != expected_id {
        return Err(HistError::InvalidReplication(format!(
          "event ids not contiguous: expected {expected_id}, got {}",
          event.event_id
        )));
      }
      if event.version != self.version {
        return Err(HistError::InvalidReplication(format!(
          "event {} version {} disagrees with batch version {}",
          event.event_id, event.version, self.version
        )));
      }
      expected_id += 1;
    }
    Ok(())
  }
}

/// How the ingress should treat a batch. Modeled as a closed set so the
/// force-buffer and reset flags cannot be combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyMode {
  #[default]
  Normal,
  /// Route to the buffer even if directly appendable.
  ForceBuffer,
  /// Truncate the current branch to the last point shared with the batch
  /// lineage before classification.
  Reset,
}

/// Outcome reported to the caller for an accepted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
  /// Events are durably part of the current branch.
  Applied,
  /// Held until the predecessor batch arrives.
  Buffered,
  /// Fully covered by identical stored events; no-op.
  Duplicate,
  /// Divergent lineage reconciled by branching. `took_over` is true when the
  /// incoming lineage superseded the local current branch.
  ConflictResolved { took_over: bool },
}

/// The wide replication request consumed from the transport layer.
#[derive(Debug, Clone)]
pub struct ReplicateRequest {
  pub domain_id: String,
  pub workflow_id: String,
  pub run_id: String,
  pub first_event_id: u64,
  pub next_event_id: u64,
  pub version: u64,
  pub source_cluster: String,
  pub history: Vec<HistoryEvent>,
  pub replication_info: IndexMap<String, ReplicationProgress>,
  pub new_run_history: Option<Vec<HistoryEvent>>,
  pub force_buffer_events: bool,
  pub event_store_version: u32,
  pub new_run_event_store_version: u32,
  pub reset_workflow: bool,
}

impl ReplicateRequest {
  /// Convert into the typed core inputs, rejecting illegal combinations.
  pub(crate) fn into_parts(
    self,
  ) -> Result<(WorkflowExecution, EventBatch, Option<EventBatch>, ApplyMode)> {
    let mode = match (self.force_buffer_events, self.reset_workflow) {
      (false, false) => ApplyMode::Normal,
      (true, false) => ApplyMode::ForceBuffer,
      (false, true) => ApplyMode::Reset,
      (true, true) => {
        return Err(HistError::InvalidReplication(
          "force-buffer and reset-workflow are mutually exclusive".to_string(),
        ))
      }
    };

    if self.event_store_version != SUPPORTED_EVENT_STORE_VERSION {
      return Err(HistError::InvalidReplication(format!(
        "unsupported event store version {}, supported {SUPPORTED_EVENT_STORE_VERSION}",
        self.event_store_version
      )));
    }

    let execution = WorkflowExecution::new(self.domain_id, self.workflow_id, self.run_id);

    let batch = EventBatch {
      first_event_id: self.first_event_id,
      next_event_id: self.next_event_id,
      version: self.version,
      source_cluster: self.source_cluster.clone(),
      events: self.history,
      replication_info: self.replication_info,
    };
    batch.validate()?;

    let new_run = match self.new_run_history {
      Some(events) => {
        if self.new_run_event_store_version != SUPPORTED_EVENT_STORE_VERSION {
          return Err(HistError::InvalidReplication(format!(
            "unsupported new-run event store version {}, supported {SUPPORTED_EVENT_STORE_VERSION}",
            self.new_run_event_store_version
          )));
        }
        let new_run = EventBatch::new(FIRST_EVENT_ID, self.version, self.source_cluster, events);
        new_run.validate()?;
        Some(new_run)
      }
      None => None,
    };

    Ok((execution, batch, new_run, mode))
  }
}
