//! Crate-wide constants.

/// First event id of any root branch.
pub const FIRST_EVENT_ID: u64 = 1;

/// Event-store payload format accepted from remote clusters.
pub const SUPPORTED_EVENT_STORE_VERSION: u32 = 2;

/// Default per-execution capacity of the out-of-order buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 32;

/// Default age in milliseconds after which a buffered batch is reported as
/// stuck replication.
pub const DEFAULT_BUFFER_AGE_HORIZON_MS: u64 = 60_000;

/// Branch manifest file name inside a run directory.
pub const BRANCH_MANIFEST_FILE_NAME: &str = "branches.json";

/// File extension of branch event segments.
pub const SEGMENT_FILE_EXT: &str = "hlog";
