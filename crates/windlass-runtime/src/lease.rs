//! Lease manager: single-owner execution enforced by fencing tokens.
//!
//! Tokens increase strictly per (workflow, step) across the manager's
//! lifetime, so a late worker holding an older token can never satisfy
//! `validate_for_commit` once a newer lease has been issued, regardless of
//! clock skew, GC pauses, or network reordering. All expiry checks take an
//! explicit monotonic `now`; nothing here reads wall-clock time.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use windlass_kernel::ids::{FencingToken, StepName, WorkflowId};

use crate::error::EngineError;
use crate::models::Lease;

/// Result of a point lease check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseCheck {
    Valid,
    Expired,
    Unknown,
}

#[derive(Default)]
struct LeaseTables {
    active: HashMap<String, Lease>,
    tokens: HashMap<(WorkflowId, StepName), FencingToken>,
}

/// Single-writer owner of the lease tables.
#[derive(Default)]
pub struct LeaseManager {
    inner: Mutex<LeaseTables>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a lease with the next fencing token for (workflow, step) and a
    /// deadline of `now + duration`. Every call returns a strictly larger
    /// token than any prior acquire for the same pair.
    pub fn acquire(
        &self,
        workflow_id: &str,
        step: &str,
        attempt: u32,
        duration: Duration,
        now: Instant,
    ) -> Lease {
        let mut inner = self.lock();
        let token = inner
            .tokens
            .entry((workflow_id.to_string(), step.to_string()))
            .or_insert(0);
        *token += 1;
        let lease = Lease {
            lease_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            step: step.to_string(),
            attempt,
            expires_at: now + duration,
            fencing_token: *token,
        };
        debug!(
            workflow_id,
            step,
            attempt,
            fencing_token = lease.fencing_token,
            lease_id = %lease.lease_id,
            "lease acquired"
        );
        inner.active.insert(lease.lease_id.clone(), lease.clone());
        lease
    }

    pub fn check(&self, lease_id: &str, now: Instant) -> LeaseCheck {
        let inner = self.lock();
        match inner.active.get(lease_id) {
            Some(lease) if lease.is_expired(now) => LeaseCheck::Expired,
            Some(_) => LeaseCheck::Valid,
            None => LeaseCheck::Unknown,
        }
    }

    /// Admits a commit only when the lease exists, is unexpired, stores
    /// exactly `token`, and `token` is still the highest issued for its
    /// (workflow, step). Returns the lease for the caller's bookkeeping.
    pub fn validate_for_commit(
        &self,
        lease_id: &str,
        token: FencingToken,
        now: Instant,
    ) -> Result<Lease, EngineError> {
        let inner = self.lock();
        let lease = inner
            .active
            .get(lease_id)
            .ok_or_else(|| EngineError::LeaseUnknown {
                lease_id: lease_id.to_string(),
            })?;
        if lease.is_expired(now) {
            return Err(EngineError::LeaseExpired {
                lease_id: lease_id.to_string(),
            });
        }
        if lease.fencing_token != token {
            return Err(EngineError::FencingTokenStale {
                submitted: token,
                current: lease.fencing_token,
            });
        }
        let current = inner
            .tokens
            .get(&(lease.workflow_id.clone(), lease.step.clone()))
            .copied()
            .unwrap_or(0);
        if current != token {
            return Err(EngineError::FencingTokenStale {
                submitted: token,
                current,
            });
        }
        Ok(lease.clone())
    }

    /// Removes the lease after a successful commit.
    pub fn release(&self, lease_id: &str) -> Option<Lease> {
        self.lock().active.remove(lease_id)
    }

    /// Removes expired leases; returns how many were swept.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let before = inner.active.len();
        inner.active.retain(|_, lease| !lease.is_expired(now));
        before - inner.active.len()
    }

    /// Highest token ever issued for (workflow, step); 0 if none.
    pub fn current_token(&self, workflow_id: &str, step: &str) -> FencingToken {
        self.lock()
            .tokens
            .get(&(workflow_id.to_string(), step.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LeaseTables> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_millis(50);

    #[test]
    fn tokens_increase_strictly_per_workflow_step() {
        let manager = LeaseManager::new();
        let now = Instant::now();
        let a = manager.acquire("wf-1", "s1", 1, LEASE, now);
        let b = manager.acquire("wf-1", "s1", 2, LEASE, now);
        let other = manager.acquire("wf-1", "s2", 1, LEASE, now);
        assert_eq!(a.fencing_token, 1);
        assert_eq!(b.fencing_token, 2);
        assert_eq!(other.fencing_token, 1, "token space is per (workflow, step)");
    }

    #[test]
    fn a_thousand_acquires_interleaved_with_releases_stay_monotonic() {
        let manager = LeaseManager::new();
        let now = Instant::now();
        let mut tokens = Vec::with_capacity(1000);
        for i in 0..1000u32 {
            let lease = manager.acquire("wf-1", "s1", i + 1, LEASE, now);
            tokens.push(lease.fencing_token);
            if i % 2 == 0 {
                manager.release(&lease.lease_id);
            }
        }
        let expected: Vec<u64> = (1..=1000).collect();
        assert_eq!(tokens, expected);
    }

    #[test]
    fn validate_accepts_the_current_unexpired_lease() {
        let manager = LeaseManager::new();
        let now = Instant::now();
        let lease = manager.acquire("wf-1", "s1", 1, LEASE, now);
        let validated = manager
            .validate_for_commit(&lease.lease_id, lease.fencing_token, now)
            .unwrap();
        assert_eq!(validated.lease_id, lease.lease_id);
    }

    #[test]
    fn validate_rejects_expired_leases() {
        let manager = LeaseManager::new();
        let now = Instant::now();
        let lease = manager.acquire("wf-1", "s1", 1, LEASE, now);
        let later = now + LEASE + Duration::from_millis(10);
        let err = manager
            .validate_for_commit(&lease.lease_id, lease.fencing_token, later)
            .unwrap_err();
        assert!(matches!(err, EngineError::LeaseExpired { .. }));
        assert_eq!(manager.check(&lease.lease_id, later), LeaseCheck::Expired);
    }

    #[test]
    fn validate_rejects_superseded_tokens() {
        let manager = LeaseManager::new();
        let now = Instant::now();
        let old = manager.acquire("wf-1", "s1", 1, LEASE, now);
        let new = manager.acquire("wf-1", "s1", 2, LEASE, now);

        let err = manager
            .validate_for_commit(&old.lease_id, old.fencing_token, now)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::FencingTokenStale {
                submitted: 1,
                current: 2
            }
        ));
        assert!(manager
            .validate_for_commit(&new.lease_id, new.fencing_token, now)
            .is_ok());
    }

    #[test]
    fn validate_rejects_unknown_and_released_leases() {
        let manager = LeaseManager::new();
        let now = Instant::now();
        let err = manager.validate_for_commit("nope", 1, now).unwrap_err();
        assert!(matches!(err, EngineError::LeaseUnknown { .. }));
        assert_eq!(manager.check("nope", now), LeaseCheck::Unknown);

        let lease = manager.acquire("wf-1", "s1", 1, LEASE, now);
        manager.release(&lease.lease_id);
        let err = manager
            .validate_for_commit(&lease.lease_id, lease.fencing_token, now)
            .unwrap_err();
        assert!(matches!(err, EngineError::LeaseUnknown { .. }));
    }

    #[test]
    fn validate_rejects_mismatched_token_for_a_live_lease() {
        let manager = LeaseManager::new();
        let now = Instant::now();
        let lease = manager.acquire("wf-1", "s1", 1, LEASE, now);
        let err = manager
            .validate_for_commit(&lease.lease_id, lease.fencing_token + 5, now)
            .unwrap_err();
        assert!(matches!(err, EngineError::FencingTokenStale { .. }));
    }

    #[test]
    fn sweep_removes_only_expired_leases() {
        let manager = LeaseManager::new();
        let now = Instant::now();
        let short = manager.acquire("wf-1", "s1", 1, Duration::from_millis(10), now);
        let long = manager.acquire("wf-1", "s2", 1, Duration::from_millis(500), now);

        let swept = manager.sweep(now + Duration::from_millis(20));
        assert_eq!(swept, 1);
        assert_eq!(
            manager.check(&short.lease_id, now + Duration::from_millis(20)),
            LeaseCheck::Unknown
        );
        assert_eq!(
            manager.check(&long.lease_id, now + Duration::from_millis(20)),
            LeaseCheck::Valid
        );
    }

    #[test]
    fn token_space_survives_release_and_sweep() {
        let manager = LeaseManager::new();
        let now = Instant::now();
        let first = manager.acquire("wf-1", "s1", 1, Duration::from_millis(10), now);
        manager.release(&first.lease_id);
        manager.sweep(now + Duration::from_millis(20));
        let second = manager.acquire("wf-1", "s1", 2, LEASE, now + Duration::from_millis(30));
        assert_eq!(second.fencing_token, 2);
        assert_eq!(manager.current_token("wf-1", "s1"), 2);
    }
}
