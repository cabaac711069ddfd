//! Replicator configuration.

use crate::constants::{DEFAULT_BUFFER_AGE_HORIZON_MS, DEFAULT_BUFFER_CAPACITY};
use crate::error::{HistError, Result};
use std::time::Duration;

/// Options controlling a `HistoryReplicator` instance.
#[derive(Debug, Clone)]
pub struct ReplicatorOptions {
  cluster_name: String,
  known_clusters: Vec<String>,
  buffer_capacity: usize,
  buffer_age_horizon: Duration,
}

impl Default for ReplicatorOptions {
  fn default() -> Self {
    Self {
      cluster_name: String::new(),
      known_clusters: Vec::new(),
      buffer_capacity: DEFAULT_BUFFER_CAPACITY,
      buffer_age_horizon: Duration::from_millis(DEFAULT_BUFFER_AGE_HORIZON_MS),
    }
  }
}

impl ReplicatorOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Name of the local cluster this replicator runs in.
  pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
    self.cluster_name = name.into();
    self
  }

  /// Register a remote cluster allowed to appear as a batch source or in
  /// per-batch progress maps.
  pub fn known_cluster(mut self, name: impl Into<String>) -> Self {
    self.known_clusters.push(name.into());
    self
  }

  /// Per-execution capacity of the out-of-order buffer.
  pub fn buffer_capacity(mut self, capacity: usize) -> Self {
    self.buffer_capacity = capacity;
    self
  }

  /// Age after which a buffered batch is reported as stuck replication.
  pub fn buffer_age_horizon(mut self, horizon: Duration) -> Self {
    self.buffer_age_horizon = horizon;
    self
  }

  pub fn local_cluster(&self) -> &str {
    &self.cluster_name
  }

  pub fn is_known_cluster(&self, name: &str) -> bool {
    name == self.cluster_name || self.known_clusters.iter().any(|known| known == name)
  }

  pub fn capacity(&self) -> usize {
    self.buffer_capacity
  }

  pub fn age_horizon(&self) -> Duration {
    self.buffer_age_horizon
  }

  pub(crate) fn validate(&self) -> Result<()> {
    if self.cluster_name.is_empty() {
      return Err(HistError::InvalidOptions(
        "cluster name must not be empty".to_string(),
      ));
    }
    if self.buffer_capacity == 0 {
      return Err(HistError::InvalidOptions(
        "buffer capacity must be at least 1".to_string(),
      ));
    }
    for (index, name) in self.known_clusters.iter().enumerate() {
      if name.is_empty() {
        return Err(HistError::InvalidOptions(
          "known cluster name must not be empty".to_string(),
        ));
      }
      if name == &self.cluster_name || self.known_clusters[..index].contains(name) {
        return Err(HistError::InvalidOptions(format!(
          "duplicate cluster name: {name}"
        )));
      }
    }
    Ok(())
  }
}
