//! Central error type and crate result alias.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HistError>;

#[derive(Debug, Error)]
pub enum HistError {
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("invalid options: {0}")]
  InvalidOptions(String),

  #[error("invalid replication request: {0}")]
  InvalidReplication(String),

  #[error("unknown execution: {0}")]
  UnknownExecution(String),

  #[error("unknown branch {branch} for execution {execution}")]
  UnknownBranch { execution: String, branch: u64 },

  #[error("history corrupted for {execution}: {reason}")]
  HistoryCorrupted { execution: String, reason: String },

  #[error("replication conflict unresolved for {execution}: {reason}")]
  ConflictUnresolved { execution: String, reason: String },

  #[error("replication buffer full for {execution}: {capacity} batches pending")]
  BufferOverflow { execution: String, capacity: usize },

  #[error("event store unavailable: {0}")]
  StoreUnavailable(String),

  #[error("version mismatch: required {required}, current {current}")]
  VersionMismatch { required: u32, current: u32 },

  #[error("crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
  CrcMismatch { stored: u32, computed: u32 },
}

impl HistError {
  /// Whether the caller may retry the same request unchanged and expect it
  /// to eventually succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      HistError::BufferOverflow { .. } | HistError::StoreUnavailable(_)
    )
  }
}
