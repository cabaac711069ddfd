//! Durable branch-aware event store.
//!
//! Layout: one directory per run containing `branches.json` (atomic manifest,
//! CRC envelope) and one append-only `branch-NNNN.hlog` segment per branch.
//! Reopening a store rebuilds run state from the manifests and segment scans.

use super::segment::{scan_segment, SegmentFile};
use super::sidecar::{BranchManifest, BranchManifestStore, BranchRecord, MANIFEST_ENVELOPE_VERSION};
use super::{Branch, BranchId, BranchInfo, BranchTip, EventStore, RunState};
use crate::constants::{BRANCH_MANIFEST_FILE_NAME, FIRST_EVENT_ID, SEGMENT_FILE_EXT};
use crate::error::{HistError, Result};
use crate::types::{HistoryEvent, WorkflowExecution};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug)]
struct RunEntry {
  state: RunState,
  dir: PathBuf,
  segments: HashMap<BranchId, SegmentFile>,
}

/// Durable `EventStore` implementation.
///
/// The run map is locked only for lookup and registration; each run's disk
/// and state mutations run under its own lock so an fsync for one execution
/// never stalls the others.
#[derive(Debug)]
pub struct FileEventStore {
  root: PathBuf,
  runs: RwLock<HashMap<WorkflowExecution, Arc<Mutex<RunEntry>>>>,
}

impl FileEventStore {
  /// Open a store rooted at `root`, recovering any persisted runs.
  pub fn open(root: impl AsRef<Path>) -> Result<Self> {
    let root = root.as_ref().to_path_buf();
    std::fs::create_dir_all(&root)?;

    let mut runs = HashMap::new();
    for entry in std::fs::read_dir(&root)? {
      let entry = entry?;
      let dir = entry.path();
      if !dir.is_dir() {
        continue;
      }
      let manifest_path = dir.join(BRANCH_MANIFEST_FILE_NAME);
      if !manifest_path.exists() {
        continue;
      }

      let manifest = BranchManifestStore::new(&manifest_path).read()?;
      let (execution, entry) = load_run(&dir, manifest)?;
      runs.insert(execution, Arc::new(Mutex::new(entry)));
    }

    Ok(Self {
      root,
      runs: RwLock::new(runs),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn with_run<T>(
    &self,
    execution: &WorkflowExecution,
    f: impl FnOnce(&mut RunEntry) -> Result<T>,
  ) -> Result<T> {
    let entry = self
      .runs
      .read()
      .get(execution)
      .cloned()
      .ok_or_else(|| HistError::UnknownExecution(execution.to_string()))?;
    let mut entry = entry.lock();
    f(&mut entry)
  }
}

impl EventStore for FileEventStore {
  fn register_run(&self, execution: &WorkflowExecution, writer: &str) -> Result<BranchId> {
    if self.run_exists(execution) {
      return Err(HistError::InvalidReplication(format!(
        "run already registered: {execution}"
      )));
    }

    let dir = self.root.join(run_dir_name(execution));
    std::fs::create_dir_all(&dir).map_err(store_unavailable_io)?;

    let state = RunState::new_root(writer);
    let root_branch = state.current;
    write_manifest(&dir, execution, &state).map_err(store_unavailable)?;

    let mut segments = HashMap::new();
    segments.insert(
      root_branch,
      SegmentFile::create(dir.join(segment_file_name(root_branch))).map_err(store_unavailable)?,
    );

    let mut runs = self.runs.write();
    if runs.contains_key(execution) {
      return Err(HistError::InvalidReplication(format!(
        "run already registered: {execution}"
      )));
    }
    runs.insert(
      execution.clone(),
      Arc::new(Mutex::new(RunEntry {
        state,
        dir,
        segments,
      })),
    );
    Ok(root_branch)
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
    self.with_run(execution, |entry| {
      // Validate before anything hits disk.
      entry.state.validate_append(execution, branch, events)?;

      let segment = entry
        .segments
        .get_mut(&branch)
        .ok_or_else(|| HistError::UnknownBranch {
          execution: execution.to_string(),
          branch,
        })?;
      for event in events {
        segment.append(event).map_err(store_unavailable)?;
      }
      segment.sync().map_err(store_unavailable)?;

      let writer_changed = entry
        .state
        .branches
        .get(&branch)
        .is_some_and(|current| current.last_writer != writer);
      entry.state.append(execution, branch, events, writer)?;
      if writer_changed {
        write_manifest(&entry.dir, execution, &entry.state).map_err(store_unavailable)?;
      }
      Ok(())
    })
  }

  fn fork(
    &self,
    execution: &WorkflowExecution,
    parent: BranchId,
    fork_event_id: u64,
  ) -> Result<BranchId> {
    self.with_run(execution, |entry| {
      let id = entry.state.fork(execution, parent, fork_event_id)?;
      entry.segments.insert(
        id,
        SegmentFile::create(entry.dir.join(segment_file_name(id))).map_err(store_unavailable)?,
      );
      write_manifest(&entry.dir, execution, &entry.state).map_err(store_unavailable)?;
      Ok(id)
    })
  }

  fn tip(&self, execution: &WorkflowExecution, branch: BranchId) -> Result<BranchTip> {
    self.with_run(execution, |entry| entry.state.tip(execution, branch))
  }

  fn current_branch(&self, execution: &WorkflowExecution) -> Result<BranchId> {
    self.with_run(execution, |entry| Ok(entry.state.current))
  }

  fn set_current_branch(&self, execution: &WorkflowExecution, branch: BranchId) -> Result<()> {
    self.with_run(execution, |entry| {
      entry.state.set_current(execution, branch)?;
      write_manifest(&entry.dir, execution, &entry.state).map_err(store_unavailable)
    })
  }

  fn history(&self, execution: &WorkflowExecution) -> Result<Vec<HistoryEvent>> {
    self.with_run(execution, |entry| entry.state.history(execution))
  }

  fn events_in_range(
    &self,
    execution: &WorkflowExecution,
    branch: BranchId,
    first: u64,
    last: u64,
  ) -> Result<Vec<HistoryEvent>> {
    self.with_run(execution, |entry| {
      entry.state.events_in_range(execution, branch, first, last)
    })
  }

  fn branch_info(&self, execution: &WorkflowExecution, branch: BranchId) -> Result<BranchInfo> {
    self.with_run(execution, |entry| entry.state.info(execution, branch))
  }

  fn branches(&self, execution: &WorkflowExecution) -> Result<Vec<BranchInfo>> {
    self.with_run(execution, |entry| entry.state.infos(execution))
  }
}

fn load_run(dir: &Path, manifest: BranchManifest) -> Result<(WorkflowExecution, RunEntry)> {
  if manifest.version != MANIFEST_ENVELOPE_VERSION {
    return Err(HistError::VersionMismatch {
      required: manifest.version,
      current: MANIFEST_ENVELOPE_VERSION,
    });
  }

  let execution = manifest.execution.clone();
  let mut state = RunState {
    branches: HashMap::new(),
    current: manifest.current,
    next_branch_id: manifest.next_branch_id,
  };
  let mut segments = HashMap::new();

  for record in &manifest.branches {
    let segment_path = dir.join(segment_file_name(record.branch_id));
    let events = if segment_path.exists() {
      let scan = scan_segment(&segment_path)?;
      if scan.truncated_tail {
        warn!(
          execution = %execution,
          branch = record.branch_id,
          valid_len = scan.valid_len,
          "dropped incomplete trailing frame during segment recovery"
        );
        let file = std::fs::OpenOptions::new().write(true).open(&segment_path)?;
        file.set_len(scan.valid_len)?;
        file.sync_all()?;
      }
      recover_branch_events(&execution, record, scan.events)?
    } else {
      Vec::new()
    };

    state.branches.insert(
      record.branch_id,
      Branch {
        parent: record.parent,
        fork_event_id: record.fork_event_id,
        fork_version: record.fork_version,
        events,
        last_writer: record.last_writer.clone(),
      },
    );
    segments.insert(
      record.branch_id,
      SegmentFile::create(&segment_path)?,
    );
  }

  if !state.branches.contains_key(&state.current) {
    return Err(HistError::HistoryCorrupted {
      execution: execution.to_string(),
      reason: format!("manifest current branch {} has no record", state.current),
    });
  }

  Ok((
    execution,
    RunEntry {
      state,
      dir: dir.to_path_buf(),
      segments,
    },
  ))
}

/// Keep the contiguous run of owned events, skipping frames a retried append
/// may have duplicated.
fn recover_branch_events(
  execution: &WorkflowExecution,
  record: &BranchRecord,
  frames: Vec<HistoryEvent>,
) -> Result<Vec<HistoryEvent>> {
  let first_owned = record.fork_event_id.map_or(FIRST_EVENT_ID, |fork| fork + 1);
  let mut expected = first_owned;
  let mut events = Vec::with_capacity(frames.len());

  for frame in frames {
    if frame.event_id < expected {
      continue;
    }
    if frame.event_id != expected {
      return Err(HistError::HistoryCorrupted {
        execution: execution.to_string(),
        reason: format!(
          "segment gap on branch {}: expected event {expected}, found {}",
          record.branch_id, frame.event_id
        ),
      });
    }
    events.push(frame);
    expected += 1;
  }

  Ok(events)
}

fn write_manifest(dir: &Path, execution: &WorkflowExecution, state: &RunState) -> Result<()> {
  let mut records: Vec<BranchRecord> = state
    .branches
    .iter()
    .map(|(id, branch)| BranchRecord {
      branch_id: *id,
      parent: branch.parent,
      fork_event_id: branch.fork_event_id,
      fork_version: branch.fork_version,
      last_writer: branch.last_writer.clone(),
    })
    .collect();
  records.sort_by_key(|record| record.branch_id);

  BranchManifestStore::new(dir.join(BRANCH_MANIFEST_FILE_NAME)).write(&BranchManifest {
    version: MANIFEST_ENVELOPE_VERSION,
    execution: execution.clone(),
    current: state.current,
    next_branch_id: state.next_branch_id,
    branches: records,
  })
}

fn segment_file_name(id: BranchId) -> String {
  format!("branch-{id:04}.{SEGMENT_FILE_EXT}")
}

fn run_dir_name(execution: &WorkflowExecution) -> String {
  let label = execution.to_string();
  let sanitized: String = label
    .chars()
    .take(48)
    .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
    .collect();
  format!("run-{sanitized}-{:08x}", crc32fast::hash(label.as_bytes()))
}

fn store_unavailable(error: HistError) -> HistError {
  match error {
    HistError::Io(io) => HistError::StoreUnavailable(io.to_string()),
    other => other,
  }
}

fn store_unavailable_io(error: std::io::Error) -> HistError {
  HistError::StoreUnavailable(error.to_string())
}
