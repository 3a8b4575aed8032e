//! Engine telemetry types: rejection reasons and counters.
//!
//! Plain data with no built-in collection or export; fencing and idempotency
//! rejections are internal correctness events, never user-visible errors.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Why a worker-reported result was rejected at a boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    LeaseExpired,
    FencingTokenStale,
    LeaseUnknown,
    Duplicate,
    UnexpectedStep,
}

impl RejectionReason {
    /// Classifies an error as a boundary rejection, if it is one.
    pub fn classify(error: &EngineError) -> Option<RejectionReason> {
        match error {
            EngineError::LeaseExpired { .. } => Some(RejectionReason::LeaseExpired),
            EngineError::FencingTokenStale { .. } => Some(RejectionReason::FencingTokenStale),
            EngineError::LeaseUnknown { .. } => Some(RejectionReason::LeaseUnknown),
            EngineError::Duplicate { .. } => Some(RejectionReason::Duplicate),
            EngineError::UnexpectedStep { .. } => Some(RejectionReason::UnexpectedStep),
            _ => None,
        }
    }
}

/// Monotonic counters maintained by the dispatcher and sweeps.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub accepted_commits: AtomicU64,
    pub rejected_commits: AtomicU64,
    pub duplicate_commits: AtomicU64,
    pub requeued_tasks: AtomicU64,
    pub evicted_workers: AtomicU64,
    pub swept_leases: AtomicU64,
}

/// Point-in-time copy of [EngineCounters] for reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub accepted_commits: u64,
    pub rejected_commits: u64,
    pub duplicate_commits: u64,
    pub requeued_tasks: u64,
    pub evicted_workers: u64,
    pub swept_leases: u64,
}

impl EngineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            accepted_commits: self.accepted_commits.load(Ordering::Relaxed),
            rejected_commits: self.rejected_commits.load(Ordering::Relaxed),
            duplicate_commits: self.duplicate_commits.load(Ordering::Relaxed),
            requeued_tasks: self.requeued_tasks.load(Ordering::Relaxed),
            evicted_workers: self.evicted_workers.load(Ordering::Relaxed),
            swept_leases: self.swept_leases.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_covers_boundary_rejections_only() {
        assert_eq!(
            RejectionReason::classify(&EngineError::LeaseExpired {
                lease_id: "l-1".into()
            }),
            Some(RejectionReason::LeaseExpired)
        );
        assert_eq!(
            RejectionReason::classify(&EngineError::FencingTokenStale {
                submitted: 1,
                current: 2
            }),
            Some(RejectionReason::FencingTokenStale)
        );
        assert_eq!(
            RejectionReason::classify(&EngineError::Duplicate { key: "k".into() }),
            Some(RejectionReason::Duplicate)
        );
        assert_eq!(RejectionReason::classify(&EngineError::NoRunnableStep), None);
    }

    #[test]
    fn counters_snapshot() {
        let counters = EngineCounters::new();
        EngineCounters::incr(&counters.accepted_commits);
        EngineCounters::incr(&counters.accepted_commits);
        EngineCounters::add(&counters.swept_leases, 3);
        let snap = counters.snapshot();
        assert_eq!(snap.accepted_commits, 2);
        assert_eq!(snap.swept_leases, 3);
        assert_eq!(snap.rejected_commits, 0);
    }
}
