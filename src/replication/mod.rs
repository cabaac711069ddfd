//! Cross-cluster history replication.
//!
//! Ingress orchestration, batch classification, conflict resolution,
//! out-of-order buffering and continue-as-new linking.

pub mod buffer;
pub mod classifier;
pub mod continuation;
pub mod ingress;
pub mod registry;
pub mod resolver;
pub mod types;

pub use buffer::{BufferManager, BufferedBatchStatus};
pub use continuation::RunLineage;
pub use ingress::HistoryReplicator;
pub use types::{ApplyMode, ApplyOutcome, EventBatch, ReplicateRequest, ReplicationProgress};
