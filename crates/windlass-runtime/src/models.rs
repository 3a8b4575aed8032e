//! Runtime domain models: tasks, leases, worker records.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use windlass_kernel::ids::{FencingToken, StepName, WorkflowId};

/// One unit of schedulable work: execute `step` of `workflow_id` as attempt
/// number `attempt`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub workflow_id: WorkflowId,
    pub step: StepName,
    pub attempt: u32,
    pub priority: u32,
    /// Logical clock reading at enqueue time; for traces, not scheduling.
    pub enqueued_at: u64,
}

/// Time-bounded permission for a worker to execute one (workflow, step,
/// attempt). `expires_at` is a monotonic deadline, never wall-clock.
#[derive(Clone, Debug)]
pub struct Lease {
    pub lease_id: String,
    pub workflow_id: WorkflowId,
    pub step: StepName,
    pub attempt: u32,
    pub expires_at: Instant,
    pub fencing_token: FencingToken,
}

impl Lease {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// What a worker receives from `request_task`: the task plus the lease it
/// must present at commit time.
#[derive(Clone, Debug)]
pub struct TaskGrant {
    pub task: Task,
    pub lease_id: String,
    pub fencing_token: FencingToken,
    pub deadline: Instant,
}

/// Dispatcher-side view of one registered worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

#[derive(Clone, Debug)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub last_heartbeat: Instant,
    /// (task_id, lease_id) of the in-flight assignment, if any.
    pub in_flight: Option<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lease_expiry_is_a_monotonic_deadline() {
        let now = Instant::now();
        let lease = Lease {
            lease_id: "l-1".into(),
            workflow_id: "wf-1".into(),
            step: "s1".into(),
            attempt: 1,
            expires_at: now + Duration::from_millis(50),
            fencing_token: 1,
        };
        assert!(!lease.is_expired(now));
        assert!(!lease.is_expired(now + Duration::from_millis(49)));
        assert!(lease.is_expired(now + Duration::from_millis(50)));
        assert!(lease.is_expired(now + Duration::from_millis(60)));
    }
}
