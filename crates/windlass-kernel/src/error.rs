//! Kernel-level error type.
//!
//! `DiskFailure` is the only variant that propagates to callers of the write
//! path; a failed append must be treated as not having happened. `Corruption`
//! is detected during replay, truncates the damaged segment, and is not
//! fatal.

use thiserror::Error;

/// Errors from WAL and replay operations.
#[derive(Error, Debug)]
pub enum WalError {
    #[error("WAL disk failure: {0}")]
    DiskFailure(#[from] std::io::Error),

    #[error("WAL corruption in segment {segment_id} at offset {offset}: {reason}")]
    Corruption {
        segment_id: u64,
        offset: u64,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("replay mismatch for workflow {workflow_id}: event stream hash differs from expected")]
    ReplayMismatch { workflow_id: String },
}

impl From<serde_json::Error> for WalError {
    fn from(e: serde_json::Error) -> Self {
        WalError::Serialization(e.to_string())
    }
}

impl WalError {
    /// True when the error means the bytes never became durable.
    pub fn is_disk_failure(&self) -> bool {
        matches!(self, WalError::DiskFailure(_))
    }
}
