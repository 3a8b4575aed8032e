//! Runtime-level error type.
//!
//! Disk failures are the only errors that propagate through the engine to
//! callers; commit-time validation rejections are absorbed at the dispatcher
//! boundary and surface only as counters and logs.

use thiserror::Error;

use windlass_kernel::WalError;

/// Errors from coordinator, lease, and dispatch operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Disk(#[from] WalError),

    #[error("duplicate idempotency key {key}")]
    Duplicate { key: String },

    #[error("unexpected report for step {step}: {reason}")]
    UnexpectedStep { step: String, reason: String },

    #[error("lease {lease_id} has expired")]
    LeaseExpired { lease_id: String },

    #[error("fencing token {submitted} is stale (current token is {current})")]
    FencingTokenStale { submitted: u64, current: u64 },

    #[error("unknown lease {lease_id}")]
    LeaseUnknown { lease_id: String },

    #[error("workflow {workflow_id} not found")]
    NotFound { workflow_id: String },

    #[error("workflow {workflow_id} already created")]
    AlreadyCreated { workflow_id: String },

    #[error("workflow {workflow_id} is already terminal")]
    AlreadyTerminal { workflow_id: String },

    #[error("no runnable step")]
    NoRunnableStep,
}

impl EngineError {
    /// True when the error means bytes never became durable; callers may
    /// retry the operation.
    pub fn is_disk_failure(&self) -> bool {
        matches!(self, EngineError::Disk(e) if e.is_disk_failure())
    }
}
