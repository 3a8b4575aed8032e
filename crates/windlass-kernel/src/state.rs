//! Pure workflow state machine.
//!
//! All state is derived by folding events; nothing here performs I/O, reads
//! a clock, or draws randomness. Given the same event sequence the resulting
//! state is byte-identical: this is the replay contract.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{Event, EventPayload};
use crate::ids::{StepName, WorkflowId};

/// Per-step execution status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
}

/// Overall workflow status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    /// Awaiting a coordinator decision: all steps completed (pending the
    /// `workflow_completed` append) or a retryable step failure.
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// One step's derived state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub name: StepName,
    pub status: StepStatus,
    /// How many `step_scheduled` events this step has seen; the next attempt
    /// number is this count plus one.
    pub scheduled_count: u32,
    pub error: Option<String>,
}

impl StepState {
    fn new(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            scheduled_count: 0,
            error: None,
        }
    }
}

/// Derived workflow state. Never stored directly; materialized on demand by
/// replaying the WAL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub input: Value,
    pub steps: Vec<StepState>,
    pub current_step_index: usize,
    pub status: WorkflowStatus,
    /// Count of events applied; also the sequence the next event will carry.
    pub version: u64,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Idempotency keys carried by applied events.
    pub applied_keys: BTreeSet<String>,
}

impl WorkflowState {
    /// Empty state for a workflow that has no applied events yet.
    pub fn new(workflow_id: impl Into<WorkflowId>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            name: String::new(),
            input: Value::Null,
            steps: Vec::new(),
            current_step_index: 0,
            status: WorkflowStatus::Pending,
            version: 0,
            output: None,
            error: None,
            applied_keys: BTreeSet::new(),
        }
    }

    /// Folds one event into the state. Pure; unknown step names are ignored
    /// rather than panicking so a fold can never fail.
    pub fn apply(mut self, event: &Event) -> WorkflowState {
        match &event.payload {
            EventPayload::WorkflowCreated { name, input, steps } => {
                self.name = name.clone();
                self.input = input.clone();
                self.steps = steps.iter().cloned().map(StepState::new).collect();
                self.current_step_index = 0;
                self.status = WorkflowStatus::Pending;
            }
            EventPayload::StepScheduled { step, .. } => {
                if let Some(s) = self.step_mut(step) {
                    s.status = StepStatus::Scheduled;
                    s.scheduled_count += 1;
                }
                self.status = WorkflowStatus::Running;
            }
            EventPayload::StepStarted { step, .. } => {
                if let Some(s) = self.step_mut(step) {
                    s.status = StepStatus::Running;
                }
            }
            EventPayload::StepCompleted { step, .. } => {
                if let Some(s) = self.step_mut(step) {
                    s.status = StepStatus::Completed;
                    s.error = None;
                }
                self.current_step_index = (self.current_step_index + 1).min(self.steps.len());
                self.status = if self.all_steps_completed() {
                    WorkflowStatus::Waiting
                } else {
                    WorkflowStatus::Running
                };
            }
            EventPayload::StepFailed {
                step,
                error,
                retryable,
            } => {
                if let Some(s) = self.step_mut(step) {
                    s.status = StepStatus::Failed;
                    s.error = Some(error.clone());
                }
                self.error = Some(error.clone());
                self.status = if *retryable {
                    WorkflowStatus::Waiting
                } else {
                    WorkflowStatus::Failed
                };
            }
            EventPayload::WorkflowCompleted { output } => {
                self.output = Some(output.clone());
                self.status = WorkflowStatus::Completed;
            }
            EventPayload::WorkflowFailed { reason, .. } => {
                self.error = Some(reason.clone());
                self.status = WorkflowStatus::Failed;
            }
            EventPayload::WorkflowCancelled {} => {
                self.status = WorkflowStatus::Cancelled;
            }
        }

        if let Some(key) = event.idempotency_key() {
            self.applied_keys.insert(key.to_string());
        }
        self.version += 1;
        self
    }

    /// First step whose status is `pending`, while the workflow is
    /// non-terminal; `None` otherwise.
    pub fn next_runnable_step(&self) -> Option<&StepState> {
        if self.is_terminal() {
            return None;
        }
        self.steps.iter().find(|s| s.status == StepStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn all_steps_completed(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    pub fn idempotency_key_exists(&self, key: &str) -> bool {
        self.applied_keys.contains(key)
    }

    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.name == name)
    }

    fn step_mut(&mut self, name: &str) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// How many times `step` has been scheduled (for attempt numbering).
    pub fn scheduled_count(&self, step: &str) -> u32 {
        self.step(step).map(|s| s.scheduled_count).unwrap_or(0)
    }
}

/// Rebuilds workflow state by folding `events` sorted by sequence.
pub fn hydrate(workflow_id: &str, mut events: Vec<Event>) -> WorkflowState {
    events.sort_by_key(|e| e.sequence);
    events
        .iter()
        .fold(WorkflowState::new(workflow_id), |state, event| {
            state.apply(event)
        })
}
