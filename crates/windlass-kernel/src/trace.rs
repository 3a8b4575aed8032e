//! Trace-event view of the log for observability consumers.
//!
//! `timestamp_ms` is optional wall-clock metadata stamped at read time for
//! humans; it carries no scheduling semantics (lease deadlines and event
//! ordering never look at it).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::ids::{Seq, WorkflowId};

/// Flattened view of one event for audit and telemetry consumers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowTraceEvent {
    pub workflow_id: WorkflowId,
    pub sequence: Seq,
    pub step: Option<String>,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
}

impl WorkflowTraceEvent {
    pub fn from_event(event: &Event) -> Self {
        Self {
            workflow_id: event.workflow_id.clone(),
            sequence: event.sequence,
            step: event.payload.step().map(str::to_string),
            kind: event.event_type().to_string(),
            timestamp_ms: None,
        }
    }

    /// Same view, stamped with a wall-clock reading for display.
    pub fn stamped(event: &Event, now: DateTime<Utc>) -> Self {
        let mut trace = Self::from_event(event);
        trace.timestamp_ms = Some(now.timestamp_millis());
        trace
    }
}

/// Trace view of a whole event stream.
pub fn trace_from_events(events: &[Event]) -> Vec<WorkflowTraceEvent> {
    events.iter().map(WorkflowTraceEvent::from_event).collect()
}
