//! Event envelope and payloads: the universal shape of every durable state
//! change.
//!
//! Events are the source of truth; all workflow state is derived by folding
//! them. Constraints: `event_id` is unique across the log; within a workflow
//! `sequence` is dense and strictly increasing starting at 0; a terminal
//! event is the last event ever appended for its workflow; events are never
//! rewritten, deleted, or reordered.
//!
//! Serialization is serde_json of the envelope with the payload internally
//! tagged by event type: deterministic (stable struct field order, ordered
//! metadata map) and self-describing, so a reader that never saw the writing
//! process can decode semantically equal events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::WalError;
use crate::ids::{EventId, Seq, StepName, WorkflowId};

/// Metadata key under which commit-class events carry their idempotency key.
pub const METADATA_IDEMPOTENCY_KEY: &str = "idempotency_key";

/// Closed enumeration of event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowCreated,
    StepScheduled,
    StepStarted,
    StepCompleted,
    StepFailed,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
}

impl EventType {
    /// Current schema version for this event type (monotonic per type).
    pub fn schema_version(self) -> u32 {
        1
    }

    /// True for event types that end a workflow's log.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventType::WorkflowCompleted | EventType::WorkflowFailed | EventType::WorkflowCancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::WorkflowCreated => "workflow_created",
            EventType::StepScheduled => "step_scheduled",
            EventType::StepStarted => "step_started",
            EventType::StepCompleted => "step_completed",
            EventType::StepFailed => "step_failed",
            EventType::WorkflowCompleted => "workflow_completed",
            EventType::WorkflowFailed => "workflow_failed",
            EventType::WorkflowCancelled => "workflow_cancelled",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event-type-specific payload, tagged by event type on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    WorkflowCreated {
        name: String,
        input: Value,
        steps: Vec<StepName>,
    },
    StepScheduled {
        step: StepName,
        attempt: u32,
    },
    StepStarted {
        step: StepName,
        lease_id: String,
        worker_id: String,
    },
    StepCompleted {
        step: StepName,
        result: Value,
        duration_ms: u64,
    },
    StepFailed {
        step: StepName,
        error: String,
        retryable: bool,
    },
    WorkflowCompleted {
        output: Value,
    },
    WorkflowFailed {
        reason: String,
        final_step: Option<StepName>,
    },
    WorkflowCancelled {},
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::WorkflowCreated { .. } => EventType::WorkflowCreated,
            EventPayload::StepScheduled { .. } => EventType::StepScheduled,
            EventPayload::StepStarted { .. } => EventType::StepStarted,
            EventPayload::StepCompleted { .. } => EventType::StepCompleted,
            EventPayload::StepFailed { .. } => EventType::StepFailed,
            EventPayload::WorkflowCompleted { .. } => EventType::WorkflowCompleted,
            EventPayload::WorkflowFailed { .. } => EventType::WorkflowFailed,
            EventPayload::WorkflowCancelled {} => EventType::WorkflowCancelled,
        }
    }

    /// Step name carried by the payload, when the event concerns one step.
    pub fn step(&self) -> Option<&str> {
        match self {
            EventPayload::StepScheduled { step, .. }
            | EventPayload::StepStarted { step, .. }
            | EventPayload::StepCompleted { step, .. }
            | EventPayload::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }
}

/// The canonical event envelope written to the WAL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub schema_version: u32,
    pub workflow_id: WorkflowId,
    pub sequence: Seq,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Logical clock reading; orders traces, never drives scheduling.
    pub timestamp: u64,
    pub payload: EventPayload,
    /// Non-semantic key/value map; ordered so serialization is stable.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Event {
    /// Builds an event with a fresh id and the schema version of its type.
    pub fn new(
        workflow_id: impl Into<WorkflowId>,
        sequence: Seq,
        timestamp: u64,
        payload: EventPayload,
    ) -> Self {
        let schema_version = payload.event_type().schema_version();
        Self {
            event_id: Uuid::new_v4().to_string(),
            schema_version,
            workflow_id: workflow_id.into(),
            sequence,
            causation_id: None,
            correlation_id: None,
            timestamp,
            payload,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_causation(mut self, causation_id: impl Into<EventId>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type().is_terminal()
    }

    /// Idempotency key carried in metadata, when present.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.metadata.get(METADATA_IDEMPOTENCY_KEY).map(String::as_str)
    }

    /// Serializes the envelope for the WAL payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WalError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WalError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Deterministic fingerprint of one logical attempt:
/// `SHA-256(workflow_id ‖ step ‖ attempt)`, lowercase hex.
pub fn derive_idempotency_key(workflow_id: &str, step: &str, attempt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workflow_id.as_bytes());
    hasher.update(b"|");
    hasher.update(step.as_bytes());
    hasher.update(b"|");
    hasher.update(attempt.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}
