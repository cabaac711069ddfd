//! Branch-aware workflow history storage with cross-cluster replication.
//!
//! `histdb` keeps one append-only, forkable event history per workflow run
//! and merges replicated batches from remote clusters into it, tolerating
//! duplicate, reordered and conflicting delivery. Readers only ever see the
//! current branch; superseded lineages are retained for audit and reset.

pub mod config;
pub mod constants;
pub mod error;
pub mod replication;
pub mod store;
pub mod types;

pub use config::ReplicatorOptions;
pub use error::{HistError, Result};
pub use replication::{
  ApplyMode, ApplyOutcome, BufferedBatchStatus, EventBatch, HistoryReplicator, ReplicateRequest,
  ReplicationProgress, RunLineage,
};
pub use store::file::FileEventStore;
pub use store::memory::MemoryEventStore;
pub use store::{BranchId, BranchInfo, BranchTip, EventStore};
pub use types::{EventType, HistoryEvent, HistoryPosition, WorkflowExecution};
