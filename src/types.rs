//! Core identity and event types shared by the store and replication layers.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Identity tuple of a single workflow run, the unit of serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
  pub domain_id: String,
  pub workflow_id: String,
  pub run_id: String,
}

impl WorkflowExecution {
  pub fn new(
    domain_id: impl Into<String>,
    workflow_id: impl Into<String>,
    run_id: impl Into<String>,
  ) -> Self {
    Self {
      domain_id: domain_id.into(),
      workflow_id: workflow_id.into(),
      run_id: run_id.into(),
    }
  }

  /// Same workflow chain, different run (successor runs share domain and
  /// workflow id).
  pub fn with_run(&self, run_id: impl Into<String>) -> Self {
    Self {
      domain_id: self.domain_id.clone(),
      workflow_id: self.workflow_id.clone(),
      run_id: run_id.into(),
    }
  }
}

impl fmt::Display for WorkflowExecution {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}/{}", self.domain_id, self.workflow_id, self.run_id)
  }
}

/// Workflow history event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
  WorkflowExecutionStarted,
  DecisionTaskScheduled,
  DecisionTaskStarted,
  DecisionTaskCompleted,
  ActivityTaskScheduled,
  ActivityTaskStarted,
  ActivityTaskCompleted,
  TimerStarted,
  TimerFired,
  WorkflowExecutionSignaled,
  MarkerRecorded,
  WorkflowExecutionCompleted,
  WorkflowExecutionFailed,
  WorkflowExecutionContinuedAsNew,
}

impl EventType {
  /// Whether this event completes the run by starting a successor run.
  pub fn is_continuation(self) -> bool {
    matches!(self, EventType::WorkflowExecutionContinuedAsNew)
  }

  /// Whether this event terminates the run.
  pub fn closes_run(self) -> bool {
    matches!(
      self,
      EventType::WorkflowExecutionCompleted
        | EventType::WorkflowExecutionFailed
        | EventType::WorkflowExecutionContinuedAsNew
    )
  }
}

/// One durable history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
  pub event_id: u64,
  pub event_type: EventType,
  pub timestamp_ms: u64,
  pub version: u64,
  pub task_id: u64,
  #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
  pub attributes: serde_json::Value,
}

impl HistoryEvent {
  pub fn new(event_id: u64, event_type: EventType, version: u64) -> Self {
    Self {
      event_id,
      event_type,
      timestamp_ms: 0,
      version,
      task_id: event_id,
      attributes: serde_json::Value::Null,
    }
  }

  pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
    self.timestamp_ms = timestamp_ms;
    self
  }

  pub fn with_attributes(mut self, attributes: serde_json::Value) -> Self {
    self.attributes = attributes;
    self
  }

  /// Run id of the successor run carried by a continuation event.
  pub fn continued_run_id(&self) -> Option<&str> {
    if !self.event_type.is_continuation() {
      return None;
    }
    self.attributes.get("new_execution_run_id")?.as_str()
  }
}

/// A point in a run's history: failover version plus event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct HistoryPosition {
  pub version: u64,
  pub event_id: u64,
}

impl HistoryPosition {
  pub const fn new(version: u64, event_id: u64) -> Self {
    Self { version, event_id }
  }
}

impl fmt::Display for HistoryPosition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.version, self.event_id)
  }
}

impl Ord for HistoryPosition {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .version
      .cmp(&other.version)
      .then_with(|| self.event_id.cmp(&other.event_id))
  }
}

impl PartialOrd for HistoryPosition {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl FromStr for HistoryPosition {
  type Err = PositionParseError;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    let mut parts = raw.split(':');
    let version = parse_u64_component(parts.next(), "version", raw)?;
    let event_id = parse_u64_component(parts.next(), "event_id", raw)?;

    if parts.next().is_some() {
      return Err(PositionParseError::new(format!(
        "invalid position format: {raw}"
      )));
    }

    Ok(Self::new(version, event_id))
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionParseError {
  message: String,
}

impl PositionParseError {
  fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

impl fmt::Display for PositionParseError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.message)
  }
}

impl std::error::Error for PositionParseError {}

fn parse_u64_component(
  value: Option<&str>,
  component: &'static str,
  original: &str,
) -> Result<u64, PositionParseError> {
  let value = value.ok_or_else(|| {
    PositionParseError::new(format!(
      "invalid position ({component} missing): {original}"
    ))
  })?;

  if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
    return Err(PositionParseError::new(format!(
      "invalid {component}: {value}"
    )));
  }

  value.parse::<u64>().map_err(|_| {
    PositionParseError::new(format!(
      "invalid position ({component} overflow): {original}"
    ))
  })
}

#[cfg(test)]
mod tests {
  use super::{EventType, HistoryEvent, HistoryPosition};
  use rand::{rngs::StdRng, Rng, SeedableRng};
  use serde_json::json;
  use std::str::FromStr;

  #[test]
  fn position_roundtrip_fuzz_like() {
    let mut rng = StdRng::seed_from_u64(0xfeed_f00d);

    for _ in 0..2_000 {
      let position =
        HistoryPosition::new(rng.gen_range(0..10_000), rng.gen_range(0..10_000_000));
      let parsed = HistoryPosition::from_str(&position.to_string()).expect("parse position");
      assert_eq!(parsed, position);
    }
  }

  #[test]
  fn position_invalid_strings_rejected() {
    let invalid = [
      "", "1", "1:", ":2", "1:2:3", "x:1", "1:y", "-1:2", "1:-2", " 1:2", "1:2 ",
    ];

    for raw in invalid {
      assert!(
        HistoryPosition::from_str(raw).is_err(),
        "position should fail: {raw}"
      );
    }
  }

  #[test]
  fn position_ordering_is_version_major() {
    let p1 = HistoryPosition::new(100, 41);
    let p2 = HistoryPosition::new(100, 42);
    let p3 = HistoryPosition::new(200, 1);
    assert!(p1 < p2);
    assert!(p2 < p3);
  }

  #[test]
  fn continuation_run_id_requires_continuation_event() {
    let attrs = json!({ "new_execution_run_id": "run-b" });

    let continued =
      HistoryEvent::new(9, EventType::WorkflowExecutionContinuedAsNew, 100).with_attributes(attrs.clone());
    assert_eq!(continued.continued_run_id(), Some("run-b"));

    let completed =
      HistoryEvent::new(9, EventType::WorkflowExecutionCompleted, 100).with_attributes(attrs);
    assert_eq!(completed.continued_run_id(), None);
  }

  #[test]
  fn closing_event_classification() {
    assert!(EventType::WorkflowExecutionContinuedAsNew.closes_run());
    assert!(EventType::WorkflowExecutionContinuedAsNew.is_continuation());
    assert!(EventType::WorkflowExecutionCompleted.closes_run());
    assert!(!EventType::WorkflowExecutionCompleted.is_continuation());
    assert!(!EventType::ActivityTaskStarted.closes_run());
  }
}
