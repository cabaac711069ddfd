use std::path::Path;
use std::sync::Arc;

use histdb::{
  ApplyMode, ApplyOutcome, EventBatch, EventType, FileEventStore, HistoryEvent,
  HistoryReplicator, ReplicatorOptions, WorkflowExecution,
};

fn replicator(root: &Path) -> HistoryReplicator {
  HistoryReplicator::new(
    Arc::new(FileEventStore::open(root).expect("open store")),
    ReplicatorOptions::new()
      .cluster_name("standby")
      .known_cluster("active")
      .known_cluster("other"),
  )
  .expect("replicator")
}

fn batch(first: u64, count: u64, version: u64, source: &str) -> EventBatch {
  let events: Vec<HistoryEvent> = (first..first + count)
    .map(|id| {
      let event_type = if id == 1 {
        EventType::WorkflowExecutionStarted
      } else {
        EventType::ActivityTaskCompleted
      };
      HistoryEvent::new(id, event_type, version)
    })
    .collect();
  EventBatch::new(first, version, source, events)
}

#[test]
fn replicated_history_survives_reopen() {
  let dir = tempfile::tempdir().expect("tempdir");
  let execution = WorkflowExecution::new("domain", "workflow", "run");

  {
    let replicator = replicator(dir.path());
    replicator
      .apply_batch(&execution, batch(1, 4, 100, "active"), ApplyMode::Normal)
      .expect("apply");
    replicator
      .apply_batch(&execution, batch(5, 2, 100, "active"), ApplyMode::Normal)
      .expect("apply");
  }

  let reopened = replicator(dir.path());
  let history = reopened.history(&execution).expect("history");
  let ids: Vec<u64> = history.iter().map(|event| event.event_id).collect();
  assert_eq!(ids, (1..=6).collect::<Vec<u64>>());

  // The reopened store keeps accepting contiguous batches.
  assert_eq!(
    reopened
      .apply_batch(&execution, batch(7, 1, 100, "active"), ApplyMode::Normal)
      .expect("apply after reopen"),
    ApplyOutcome::Applied
  );
}

#[test]
fn conflict_branches_survive_reopen() {
  let dir = tempfile::tempdir().expect("tempdir");
  let execution = WorkflowExecution::new("domain", "workflow", "run");

  {
    let replicator = replicator(dir.path());
    replicator
      .apply_batch(&execution, batch(1, 5, 100, "active"), ApplyMode::Normal)
      .expect("seed");
    let outcome = replicator
      .apply_batch(&execution, batch(4, 3, 200, "other"), ApplyMode::Normal)
      .expect("conflict");
    assert_eq!(outcome, ApplyOutcome::ConflictResolved { took_over: true });
  }

  let reopened = replicator(dir.path());
  let history = reopened.history(&execution).expect("history");
  assert_eq!(history.len(), 6);
  assert_eq!(history[2].version, 100);
  assert_eq!(history[3].version, 200);

  let branches = reopened.branches(&execution).expect("branches");
  assert_eq!(branches.len(), 2);
  let superseded = branches.iter().find(|info| !info.current).expect("superseded");
  assert_eq!(superseded.tip_event_id, 5);
  assert_eq!(superseded.tip_version, 100);
  assert_eq!(superseded.last_writer, "active");

  let current = branches.iter().find(|info| info.current).expect("current");
  assert_eq!(current.fork_event_id, Some(3));
  assert_eq!(current.last_writer, "other");
}

#[test]
fn duplicate_detection_works_across_reopen() {
  let dir = tempfile::tempdir().expect("tempdir");
  let execution = WorkflowExecution::new("domain", "workflow", "run");

  {
    let replicator = replicator(dir.path());
    replicator
      .apply_batch(&execution, batch(1, 3, 100, "active"), ApplyMode::Normal)
      .expect("apply");
  }

  let reopened = replicator(dir.path());
  assert_eq!(
    reopened
      .apply_batch(&execution, batch(1, 3, 100, "active"), ApplyMode::Normal)
      .expect("reapply"),
    ApplyOutcome::Duplicate
  );
}

#[test]
fn interrupted_segment_append_recovers_to_last_complete_event() {
  let dir = tempfile::tempdir().expect("tempdir");
  let execution = WorkflowExecution::new("domain", "workflow", "run");

  {
    let replicator = replicator(dir.path());
    replicator
      .apply_batch(&execution, batch(1, 4, 100, "active"), ApplyMode::Normal)
      .expect("apply");
  }

  // Chop the tail of the only segment mid-frame, as a crashed append would.
  let segment_path = find_single_segment(dir.path());
  let mut bytes = std::fs::read(&segment_path).expect("read segment");
  bytes.truncate(bytes.len() - 11);
  std::fs::write(&segment_path, &bytes).expect("truncate segment");

  let reopened = replicator(dir.path());
  let history = reopened.history(&execution).expect("history");
  assert_eq!(history.len(), 3);

  // Replication resumes from the recovered tip.
  assert_eq!(
    reopened
      .apply_batch(&execution, batch(4, 2, 100, "active"), ApplyMode::Normal)
      .expect("refill"),
    ApplyOutcome::Applied
  );
  assert_eq!(reopened.history(&execution).expect("history").len(), 5);
}

#[test]
fn corrupted_segment_fails_open() {
  let dir = tempfile::tempdir().expect("tempdir");
  let execution = WorkflowExecution::new("domain", "workflow", "run");

  {
    let replicator = replicator(dir.path());
    replicator
      .apply_batch(&execution, batch(1, 2, 100, "active"), ApplyMode::Normal)
      .expect("apply");
  }

  let segment_path = find_single_segment(dir.path());
  let mut bytes = std::fs::read(&segment_path).expect("read segment");
  bytes[40] ^= 0xFF;
  std::fs::write(&segment_path, &bytes).expect("corrupt segment");

  assert!(FileEventStore::open(dir.path()).is_err());
}

fn find_single_segment(root: &Path) -> std::path::PathBuf {
  let mut segments = Vec::new();
  for entry in walk(root) {
    if entry.extension().and_then(|ext| ext.to_str()) == Some("hlog") {
      segments.push(entry);
    }
  }
  assert_eq!(segments.len(), 1, "expected exactly one segment");
  segments.remove(0)
}

fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
  let mut files = Vec::new();
  for entry in std::fs::read_dir(dir).expect("read dir") {
    let path = entry.expect("entry").path();
    if path.is_dir() {
      files.extend(walk(&path));
    } else {
      files.push(path);
    }
  }
  files
}
