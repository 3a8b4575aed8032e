//! Per-workflow coordinator: the only entity that appends events for its
//! workflow.
//!
//! Operations are serialized by a per-coordinator mutex (the mailbox-per-run
//! pattern expressed as a single-writer owner). Ordering rule: the WAL is
//! written BEFORE any in-memory state update; when the WAL returns a failure
//! the state update is skipped entirely and the error is surfaced unchanged.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Value};
use tracing::debug;

use windlass_kernel::clock::LogicalClock;
use windlass_kernel::event::{Event, EventPayload, METADATA_IDEMPOTENCY_KEY};
use windlass_kernel::ids::{StepName, WorkflowId};
use windlass_kernel::state::{self, StepStatus, WorkflowState};
use windlass_kernel::wal::WalService;

use crate::error::EngineError;

/// Outcome of [WorkflowCoordinator::advance].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Advanced {
    /// A step was scheduled; the caller is expected to enqueue it.
    Scheduled { step: StepName, attempt: u32 },
    /// Every step had completed, so `workflow_completed` was appended.
    Completed,
}

/// Single-writer owner of one workflow's derived state.
pub struct WorkflowCoordinator {
    workflow_id: WorkflowId,
    wal: Arc<WalService>,
    clock: Arc<LogicalClock>,
    state: Mutex<WorkflowState>,
}

impl WorkflowCoordinator {
    pub fn new(
        workflow_id: impl Into<WorkflowId>,
        wal: Arc<WalService>,
        clock: Arc<LogicalClock>,
    ) -> Self {
        let workflow_id = workflow_id.into();
        let state = WorkflowState::new(workflow_id.clone());
        Self {
            workflow_id,
            wal,
            clock,
            state: Mutex::new(state),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Snapshot of the derived state.
    pub fn state(&self) -> WorkflowState {
        self.lock().clone()
    }

    /// Replays the WAL for this workflow and folds the events; no writes.
    /// Also advances the logical clock past every replayed timestamp.
    pub fn hydrate(&self) -> Result<(), EngineError> {
        let events = self.wal.replay(&self.workflow_id)?;
        if let Some(max_ts) = events.iter().map(|e| e.timestamp).max() {
            self.clock.observe(max_ts);
        }
        let hydrated = state::hydrate(&self.workflow_id, events);
        *self.lock() = hydrated;
        Ok(())
    }

    /// Appends `workflow_created` with sequence 0 and applies it.
    pub fn create(
        &self,
        name: &str,
        input: Value,
        steps: Vec<StepName>,
    ) -> Result<(), EngineError> {
        let mut guard = self.lock();
        if guard.version > 0 {
            return Err(EngineError::AlreadyCreated {
                workflow_id: self.workflow_id.clone(),
            });
        }
        self.append_and_apply(
            &mut guard,
            EventPayload::WorkflowCreated {
                name: name.to_string(),
                input,
                steps,
            },
            None,
        )
    }

    /// Schedules the next runnable step, or seals the workflow with
    /// `workflow_completed` when every step has completed.
    pub fn advance(&self) -> Result<Advanced, EngineError> {
        let mut guard = self.lock();
        if guard.version == 0 {
            return Err(EngineError::NotFound {
                workflow_id: self.workflow_id.clone(),
            });
        }
        if guard.is_terminal() {
            return Err(EngineError::NoRunnableStep);
        }
        if let Some(step) = guard.next_runnable_step() {
            let step = step.name.clone();
            let attempt = guard.scheduled_count(&step) + 1;
            self.append_and_apply(
                &mut guard,
                EventPayload::StepScheduled {
                    step: step.clone(),
                    attempt,
                },
                None,
            )?;
            return Ok(Advanced::Scheduled { step, attempt });
        }
        if guard.all_steps_completed() {
            let completed_steps: Vec<&str> =
                guard.steps.iter().map(|s| s.name.as_str()).collect();
            let output = json!({ "completed_steps": completed_steps });
            self.append_and_apply(&mut guard, EventPayload::WorkflowCompleted { output }, None)?;
            return Ok(Advanced::Completed);
        }
        Err(EngineError::NoRunnableStep)
    }

    /// Optional progress marker: records that a worker began executing a
    /// scheduled step.
    pub fn step_started(
        &self,
        step: &str,
        lease_id: &str,
        worker_id: &str,
    ) -> Result<(), EngineError> {
        let mut guard = self.lock();
        self.ensure_step_is(&guard, step, &[StepStatus::Scheduled])?;
        self.append_and_apply(
            &mut guard,
            EventPayload::StepStarted {
                step: step.to_string(),
                lease_id: lease_id.to_string(),
                worker_id: worker_id.to_string(),
            },
            None,
        )
    }

    /// The commit gate for successful step results.
    pub fn step_completed(
        &self,
        step: &str,
        result: Value,
        duration_ms: u64,
        idempotency_key: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut guard = self.lock();
        if let Some(key) = idempotency_key {
            if guard.idempotency_key_exists(key) {
                return Err(EngineError::Duplicate {
                    key: key.to_string(),
                });
            }
        }
        self.ensure_step_is(&guard, step, &[StepStatus::Scheduled, StepStatus::Running])?;
        self.append_and_apply(
            &mut guard,
            EventPayload::StepCompleted {
                step: step.to_string(),
                result,
                duration_ms,
            },
            idempotency_key,
        )
    }

    /// The commit gate for failed step results; `retryable` decides whether
    /// the workflow waits or fails terminally.
    pub fn step_failed(
        &self,
        step: &str,
        error: &str,
        retryable: bool,
        idempotency_key: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut guard = self.lock();
        if let Some(key) = idempotency_key {
            if guard.idempotency_key_exists(key) {
                return Err(EngineError::Duplicate {
                    key: key.to_string(),
                });
            }
        }
        self.ensure_step_is(&guard, step, &[StepStatus::Scheduled, StepStatus::Running])?;
        self.append_and_apply(
            &mut guard,
            EventPayload::StepFailed {
                step: step.to_string(),
                error: error.to_string(),
                retryable,
            },
            idempotency_key,
        )
    }

    /// Operator-level terminal failure.
    pub fn fail(&self, reason: &str, final_step: Option<StepName>) -> Result<(), EngineError> {
        let mut guard = self.lock();
        if guard.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                workflow_id: self.workflow_id.clone(),
            });
        }
        self.append_and_apply(
            &mut guard,
            EventPayload::WorkflowFailed {
                reason: reason.to_string(),
                final_step,
            },
            None,
        )
    }

    pub fn cancel(&self) -> Result<(), EngineError> {
        let mut guard = self.lock();
        if guard.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                workflow_id: self.workflow_id.clone(),
            });
        }
        self.append_and_apply(&mut guard, EventPayload::WorkflowCancelled {}, None)
    }

    /// Builds the next event (sequence = current version), writes it to the
    /// WAL, and only then folds it into the in-memory state.
    fn append_and_apply(
        &self,
        guard: &mut MutexGuard<'_, WorkflowState>,
        payload: EventPayload,
        idempotency_key: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut event = Event::new(
            self.workflow_id.clone(),
            guard.version,
            self.clock.tick(),
            payload,
        );
        if let Some(key) = idempotency_key {
            event = event.with_metadata(METADATA_IDEMPOTENCY_KEY, key);
        }
        self.wal.append(&event)?;
        **guard = guard.clone().apply(&event);
        debug!(
            workflow_id = %self.workflow_id,
            sequence = event.sequence,
            event_type = %event.event_type(),
            "event committed"
        );
        Ok(())
    }

    fn ensure_step_is(
        &self,
        state: &WorkflowState,
        step: &str,
        admitted: &[StepStatus],
    ) -> Result<(), EngineError> {
        if state.is_terminal() {
            return Err(EngineError::UnexpectedStep {
                step: step.to_string(),
                reason: "workflow is terminal".into(),
            });
        }
        match state.step(step) {
            None => Err(EngineError::UnexpectedStep {
                step: step.to_string(),
                reason: "unknown step".into(),
            }),
            Some(s) if !admitted.contains(&s.status) => Err(EngineError::UnexpectedStep {
                step: step.to_string(),
                reason: format!("step status is {:?}", s.status),
            }),
            Some(_) => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkflowState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
