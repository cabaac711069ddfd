//! Append-only event frame codec for branch segment files.

use crate::error::{HistError, Result};
use crate::types::HistoryEvent;
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

const FRAME_MAGIC: &[u8; 4] = b"HEV1";
const FRAME_HEADER_BYTES: usize = 28;

/// Result of scanning a segment file.
#[derive(Debug)]
pub struct SegmentScan {
  pub events: Vec<HistoryEvent>,
  /// Byte length of the complete-frame prefix.
  pub valid_len: u64,
  /// Whether an incomplete trailing frame was dropped (interrupted append).
  pub truncated_tail: bool,
}

/// Append handle over one branch segment file.
#[derive(Debug)]
pub struct SegmentFile {
  path: PathBuf,
  file: File,
}

impl SegmentFile {
  pub fn create(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&path)?;
    Ok(Self { path, file })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn append(&mut self, event: &HistoryEvent) -> Result<()> {
    let bytes = encode_frame(event)?;
    self.file.write_all(&bytes)?;
    Ok(())
  }

  pub fn sync(&self) -> Result<()> {
    self.file.sync_data()?;
    Ok(())
  }
}

pub fn encode_frame(event: &HistoryEvent) -> Result<Vec<u8>> {
  let payload = serde_json::to_vec(event)
    .map_err(|error| HistError::Serialization(format!("encode event frame payload: {error}")))?;
  let payload_len = u32::try_from(payload.len()).map_err(|_| {
    HistError::Serialization(format!("event frame payload too large: {}", payload.len()))
  })?;

  let mut bytes = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
  bytes.extend_from_slice(FRAME_MAGIC);
  bytes.extend_from_slice(&event.event_id.to_le_bytes());
  bytes.extend_from_slice(&event.version.to_le_bytes());
  bytes.extend_from_slice(&payload_len.to_le_bytes());
  bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
  bytes.extend_from_slice(&payload);
  Ok(bytes)
}

/// Scan all frames in a segment file.
///
/// An incomplete trailing frame is dropped and flagged; a complete frame
/// with a checksum or magic mismatch is an error.
pub fn scan_segment(path: impl AsRef<Path>) -> Result<SegmentScan> {
  let bytes = std::fs::read(path.as_ref())?;
  let mut events = Vec::new();
  let mut offset = 0usize;

  while offset < bytes.len() {
    if offset + FRAME_HEADER_BYTES > bytes.len() {
      return Ok(SegmentScan {
        events,
        valid_len: offset as u64,
        truncated_tail: true,
      });
    }

    if &bytes[offset..offset + 4] != FRAME_MAGIC {
      return Err(HistError::HistoryCorrupted {
        execution: path.as_ref().display().to_string(),
        reason: format!("bad frame magic at byte {offset}"),
      });
    }

    let mut cursor = Cursor::new(&bytes[offset + 4..offset + FRAME_HEADER_BYTES]);
    let event_id = cursor.read_u64::<LittleEndian>()?;
    let version = cursor.read_u64::<LittleEndian>()?;
    let payload_len = cursor.read_u32::<LittleEndian>()? as usize;
    let stored_crc = cursor.read_u32::<LittleEndian>()?;

    let payload_start = offset + FRAME_HEADER_BYTES;
    let payload_end = payload_start.checked_add(payload_len).ok_or_else(|| {
      HistError::HistoryCorrupted {
        execution: path.as_ref().display().to_string(),
        reason: format!("frame payload overflow at byte {offset}"),
      }
    })?;
    if payload_end > bytes.len() {
      return Ok(SegmentScan {
        events,
        valid_len: offset as u64,
        truncated_tail: true,
      });
    }

    let payload = &bytes[payload_start..payload_end];
    let computed = crc32fast::hash(payload);
    if computed != stored_crc {
      return Err(HistError::CrcMismatch {
        stored: stored_crc,
        computed,
      });
    }

    let event: HistoryEvent = serde_json::from_slice(payload)
      .map_err(|error| HistError::Serialization(format!("decode event frame payload: {error}")))?;
    if event.event_id != event_id || event.version != version {
      return Err(HistError::HistoryCorrupted {
        execution: path.as_ref().display().to_string(),
        reason: format!(
          "frame header {}:{} disagrees with payload {}:{}",
          event_id, version, event.event_id, event.version
        ),
      });
    }

    events.push(event);
    offset = payload_end;
  }

  Ok(SegmentScan {
    events,
    valid_len: offset as u64,
    truncated_tail: false,
  })
}

#[cfg(test)]
mod tests {
  use super::{scan_segment, SegmentFile};
  use crate::error::HistError;
  use crate::types::{EventType, HistoryEvent};

  fn sample_events() -> Vec<HistoryEvent> {
    vec![
      HistoryEvent::new(1, EventType::WorkflowExecutionStarted, 100),
      HistoryEvent::new(2, EventType::DecisionTaskScheduled, 100),
      HistoryEvent::new(3, EventType::DecisionTaskStarted, 200),
    ]
  }

  #[test]
  fn append_scan_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("branch-0001.hlog");

    let mut segment = SegmentFile::create(&path).expect("create");
    for event in sample_events() {
      segment.append(&event).expect("append");
    }
    segment.sync().expect("sync");

    let scan = scan_segment(&path).expect("scan");
    assert!(!scan.truncated_tail);
    assert_eq!(scan.events, sample_events());
  }

  #[test]
  fn truncated_tail_recovers_complete_prefix() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("branch-0001.hlog");

    let mut segment = SegmentFile::create(&path).expect("create");
    for event in sample_events() {
      segment.append(&event).expect("append");
    }
    segment.sync().expect("sync");

    let mut bytes = std::fs::read(&path).expect("read");
    bytes.truncate(bytes.len() - 7);
    std::fs::write(&path, &bytes).expect("truncate");

    let scan = scan_segment(&path).expect("scan");
    assert!(scan.truncated_tail);
    assert_eq!(scan.events.len(), 2);
    assert_eq!(scan.events[1].event_id, 2);
  }

  #[test]
  fn corrupt_payload_fails_scan() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("branch-0001.hlog");

    let mut segment = SegmentFile::create(&path).expect("create");
    segment
      .append(&HistoryEvent::new(1, EventType::TimerStarted, 100))
      .expect("append");
    segment.sync().expect("sync");

    let mut bytes = std::fs::read(&path).expect("read");
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&path, &bytes).expect("corrupt");

    match scan_segment(&path) {
      Err(HistError::CrcMismatch { .. }) => {}
      other => panic!("expected crc mismatch, got {other:?}"),
    }
  }

  #[test]
  fn bad_magic_fails_scan() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("branch-0001.hlog");

    let mut segment = SegmentFile::create(&path).expect("create");
    segment
      .append(&HistoryEvent::new(1, EventType::TimerStarted, 100))
      .expect("append");
    segment.sync().expect("sync");

    let mut bytes = std::fs::read(&path).expect("read");
    bytes[0] = b'X';
    std::fs::write(&path, &bytes).expect("corrupt");

    assert!(scan_segment(&path).is_err());
  }
}
