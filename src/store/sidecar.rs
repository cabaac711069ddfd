//! Durable branch manifest storage.
//!
//! One manifest per run directory, written atomically (temp file + rename)
//! inside a CRC-checked envelope.

use super::BranchId;
use crate::error::{HistError, Result};
use crate::types::WorkflowExecution;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MANIFEST_ENVELOPE_VERSION: u32 = 1;

/// Durable metadata of one branch; events live in the branch segment file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
  pub branch_id: BranchId,
  pub parent: Option<BranchId>,
  pub fork_event_id: Option<u64>,
  pub fork_version: u64,
  pub last_writer: String,
}

/// Durable branch topology of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchManifest {
  pub version: u32,
  pub execution: WorkflowExecution,
  pub current: BranchId,
  pub next_branch_id: BranchId,
  pub branches: Vec<BranchRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ManifestEnvelope {
  pub version: u32,
  pub payload_crc32: u32,
  pub manifest: BranchManifest,
}

#[derive(Debug, Clone)]
pub struct BranchManifestStore {
  path: PathBuf,
}

impl BranchManifestStore {
  pub fn new(path: impl AsRef<Path>) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn temp_path(&self) -> PathBuf {
    match self
      .path
      .extension()
      .and_then(|extension| extension.to_str())
    {
      Some(extension) => self.path.with_extension(format!("{extension}.tmp")),
      None => self.path.with_extension("tmp"),
    }
  }

  pub fn read(&self) -> Result<BranchManifest> {
    let bytes = fs::read(&self.path)?;
    decode_manifest_bytes(&bytes)
  }

  pub fn write(&self, manifest: &BranchManifest) -> Result<()> {
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)?;
    }

    let temp_path = self.temp_path();
    let bytes = encode_manifest_bytes(manifest)?;

    let mut temp_file = OpenOptions::new()
      .create(true)
      .truncate(true)
      .write(true)
      .open(&temp_path)?;

    temp_file.write_all(&bytes)?;
    temp_file.sync_all()?;

    fs::rename(&temp_path, &self.path)?;
    sync_parent_dir(self.path.parent())?;

    Ok(())
  }
}

fn encode_manifest_bytes(manifest: &BranchManifest) -> Result<Vec<u8>> {
  let payload = serde_json::to_vec(manifest)
    .map_err(|error| HistError::Serialization(format!("encode branch manifest payload: {error}")))?;

  let envelope = ManifestEnvelope {
    version: MANIFEST_ENVELOPE_VERSION,
    payload_crc32: crc32fast::hash(&payload),
    manifest: manifest.clone(),
  };

  serde_json::to_vec(&envelope)
    .map_err(|error| HistError::Serialization(format!("encode branch manifest envelope: {error}")))
}

fn decode_manifest_bytes(bytes: &[u8]) -> Result<BranchManifest> {
  let envelope: ManifestEnvelope = serde_json::from_slice(bytes)
    .map_err(|error| HistError::Serialization(format!("decode branch manifest envelope: {error}")))?;

  if envelope.version != MANIFEST_ENVELOPE_VERSION {
    return Err(HistError::VersionMismatch {
      required: envelope.version,
      current: MANIFEST_ENVELOPE_VERSION,
    });
  }

  let payload = serde_json::to_vec(&envelope.manifest)
    .map_err(|error| HistError::Serialization(format!("encode branch manifest payload: {error}")))?;

  let computed = crc32fast::hash(&payload);
  if computed != envelope.payload_crc32 {
    return Err(HistError::CrcMismatch {
      stored: envelope.payload_crc32,
      computed,
    });
  }

  Ok(envelope.manifest)
}

fn sync_parent_dir(parent: Option<&Path>) -> Result<()> {
  #[cfg(unix)]
  {
    if let Some(parent) = parent {
      let directory = File::open(parent)?;
      directory.sync_all()?;
    }
  }

  #[cfg(not(unix))]
  {
    let _ = parent;
  }

  Ok(())
}
