//! Dispatcher: binds pulled tasks to fresh leases and validates
//! worker-reported results before they reach a coordinator.
//!
//! The commit path is the safety boundary: a result is forwarded to the
//! owning coordinator only after the lease manager admits the (lease,
//! fencing token) pair. Invalid results are dropped here, counted, and
//! logged; they never reach a coordinator and never poison state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use windlass_kernel::clock::LogicalClock;
use windlass_kernel::ids::FencingToken;

use crate::error::EngineError;
use crate::lease::LeaseManager;
use crate::models::{TaskGrant, WorkerRecord, WorkerStatus};
use crate::observability::{EngineCounters, RejectionReason};
use crate::queue::TaskQueue;

/// Commit-side seam between the dispatcher and the coordinators. The
/// implementation derives the idempotency key from (workflow, step, attempt)
/// and enforces it before writing.
pub trait StepCommitter: Send + Sync {
    fn commit_completed(
        &self,
        workflow_id: &str,
        step: &str,
        attempt: u32,
        result: Value,
        duration_ms: u64,
    ) -> Result<(), EngineError>;

    fn commit_failed(
        &self,
        workflow_id: &str,
        step: &str,
        attempt: u32,
        error: &str,
        retryable: bool,
    ) -> Result<(), EngineError>;
}

/// Scheduling-side seam: how a coordinator's `step_scheduled` decision
/// becomes a queued task.
pub trait StepScheduler: Send + Sync {
    fn schedule_step(&self, workflow_id: &str, step: &str, attempt: u32) -> String;
}

/// Single-writer owner of worker records and lease/task bindings.
pub struct Dispatcher {
    queue: Arc<TaskQueue>,
    leases: Arc<LeaseManager>,
    committer: Arc<dyn StepCommitter>,
    clock: Arc<LogicalClock>,
    counters: Arc<EngineCounters>,
    lease_duration: Duration,
    worker_timeout: Duration,
    workers: Mutex<HashMap<String, WorkerRecord>>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<TaskQueue>,
        leases: Arc<LeaseManager>,
        committer: Arc<dyn StepCommitter>,
        clock: Arc<LogicalClock>,
        counters: Arc<EngineCounters>,
        lease_duration: Duration,
        worker_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            leases,
            committer,
            clock,
            counters,
            lease_duration,
            worker_timeout,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_worker(&self, worker_id: &str) {
        let mut workers = self.lock_workers();
        workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerRecord {
                worker_id: worker_id.to_string(),
                status: WorkerStatus::Idle,
                last_heartbeat: Instant::now(),
                in_flight: None,
            });
    }

    pub fn heartbeat(&self, worker_id: &str) {
        let mut workers = self.lock_workers();
        let record = workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerRecord {
                worker_id: worker_id.to_string(),
                status: WorkerStatus::Idle,
                last_heartbeat: Instant::now(),
                in_flight: None,
            });
        record.last_heartbeat = Instant::now();
    }

    /// Pulls a task and atomically binds it to a fresh lease (new fencing
    /// token). Returns `None` when the queue is empty; never blocks.
    pub fn request_task(&self, worker_id: &str) -> Option<TaskGrant> {
        self.heartbeat(worker_id);
        let task = self.queue.pull()?;
        let lease = self.leases.acquire(
            &task.workflow_id,
            &task.step,
            task.attempt,
            self.lease_duration,
            Instant::now(),
        );

        let mut workers = self.lock_workers();
        if let Some(record) = workers.get_mut(worker_id) {
            record.status = WorkerStatus::Busy;
            record.in_flight = Some((task.task_id.clone(), lease.lease_id.clone()));
        }
        debug!(
            worker_id,
            workflow_id = %task.workflow_id,
            step = %task.step,
            attempt = task.attempt,
            fencing_token = lease.fencing_token,
            "task granted"
        );
        Some(TaskGrant {
            task,
            lease_id: lease.lease_id,
            fencing_token: lease.fencing_token,
            deadline: lease.expires_at,
        })
    }

    /// Validates and, if admitted, forwards a successful result to the
    /// owning coordinator.
    pub fn report_completed(
        &self,
        worker_id: &str,
        lease_id: &str,
        fencing_token: FencingToken,
        result: Value,
        duration_ms: u64,
    ) -> Result<(), EngineError> {
        self.report(worker_id, lease_id, fencing_token, |committer, lease| {
            committer.commit_completed(
                &lease.workflow_id,
                &lease.step,
                lease.attempt,
                result.clone(),
                duration_ms,
            )
        })
    }

    /// Validates and, if admitted, forwards a failure to the owning
    /// coordinator.
    pub fn report_failed(
        &self,
        worker_id: &str,
        lease_id: &str,
        fencing_token: FencingToken,
        error: &str,
        retryable: bool,
    ) -> Result<(), EngineError> {
        self.report(worker_id, lease_id, fencing_token, |committer, lease| {
            committer.commit_failed(&lease.workflow_id, &lease.step, lease.attempt, error, retryable)
        })
    }

    fn report(
        &self,
        worker_id: &str,
        lease_id: &str,
        fencing_token: FencingToken,
        commit: impl Fn(&dyn StepCommitter, &crate::models::Lease) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        self.heartbeat(worker_id);
        let now = Instant::now();

        let lease = match self.leases.validate_for_commit(lease_id, fencing_token, now) {
            Ok(lease) => lease,
            Err(err) => {
                // The result is forfeit; it must never reach a coordinator.
                EngineCounters::incr(&self.counters.rejected_commits);
                warn!(
                    worker_id,
                    lease_id,
                    fencing_token,
                    reason = ?RejectionReason::classify(&err),
                    "worker result dropped at commit validation"
                );
                self.finish_assignment(worker_id, None);
                return Err(err);
            }
        };

        let outcome = commit(self.committer.as_ref(), &lease);
        match outcome {
            Ok(()) => {
                self.leases.release(lease_id);
                EngineCounters::incr(&self.counters.accepted_commits);
                self.finish_assignment(worker_id, Some(CompletedTask::Resolve));
                Ok(())
            }
            Err(err) if err.is_disk_failure() => {
                // Nothing durable happened; put the task back so the step can
                // be retried once the disk recovers.
                self.leases.release(lease_id);
                self.finish_assignment(worker_id, Some(CompletedTask::Requeue));
                EngineCounters::incr(&self.counters.requeued_tasks);
                Err(err)
            }
            Err(err) => {
                // Duplicate or unexpected-step: absorbed at this boundary.
                self.leases.release(lease_id);
                if matches!(err, EngineError::Duplicate { .. }) {
                    EngineCounters::incr(&self.counters.duplicate_commits);
                } else {
                    EngineCounters::incr(&self.counters.rejected_commits);
                }
                debug!(
                    worker_id,
                    lease_id,
                    reason = ?RejectionReason::classify(&err),
                    "worker result absorbed by coordinator gate"
                );
                self.finish_assignment(worker_id, Some(CompletedTask::Resolve));
                Ok(())
            }
        }
    }

    /// Evicts workers silent for longer than the worker timeout and requeues
    /// their in-flight tasks. The stale lease keeps guarding the commit gate
    /// until it expires.
    pub fn sweep_workers(&self, now: Instant) -> usize {
        let mut workers = self.lock_workers();
        let timeout = self.worker_timeout;
        let dead: Vec<String> = workers
            .values()
            .filter(|w| now.duration_since(w.last_heartbeat) > timeout)
            .map(|w| w.worker_id.clone())
            .collect();
        for worker_id in &dead {
            if let Some(record) = workers.remove(worker_id) {
                if let Some((task_id, lease_id)) = record.in_flight {
                    warn!(
                        worker_id = %worker_id,
                        task_id = %task_id,
                        lease_id = %lease_id,
                        "worker evicted; requeueing its in-flight task"
                    );
                    if self.queue.requeue(&task_id) {
                        EngineCounters::incr(&self.counters.requeued_tasks);
                    }
                } else {
                    warn!(worker_id = %worker_id, "idle worker evicted");
                }
                EngineCounters::incr(&self.counters.evicted_workers);
            }
        }
        dead.len()
    }

    /// Removes expired leases; periodic housekeeping.
    pub fn sweep_leases(&self, now: Instant) -> usize {
        let swept = self.leases.sweep(now);
        EngineCounters::add(&self.counters.swept_leases, swept as u64);
        swept
    }

    pub fn worker_count(&self) -> usize {
        self.lock_workers().len()
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.lock_workers().get(worker_id).cloned()
    }

    fn finish_assignment(&self, worker_id: &str, task_outcome: Option<CompletedTask>) {
        let mut workers = self.lock_workers();
        if let Some(record) = workers.get_mut(worker_id) {
            if let Some((task_id, _)) = record.in_flight.take() {
                match task_outcome {
                    Some(CompletedTask::Resolve) => {
                        self.queue.complete(&task_id);
                    }
                    Some(CompletedTask::Requeue) => {
                        self.queue.requeue(&task_id);
                    }
                    None => {
                        // Validation failure: the task was already requeued by
                        // a sweep (or will be once the lease expires); leave
                        // the queue alone.
                    }
                }
            }
            record.status = WorkerStatus::Idle;
        }
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkerRecord>> {
        match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

enum CompletedTask {
    Resolve,
    Requeue,
}

impl StepScheduler for Dispatcher {
    fn schedule_step(&self, workflow_id: &str, step: &str, attempt: u32) -> String {
        self.queue
            .enqueue(workflow_id, step, attempt, 0, self.clock.peek())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeCommitter {
        commits: StdMutex<Vec<(String, String, u32, bool)>>,
        fail_with: StdMutex<Option<EngineError>>,
    }

    impl FakeCommitter {
        fn recorded(&self) -> Vec<(String, String, u32, bool)> {
            self.commits.lock().unwrap().clone()
        }

        fn fail_next(&self, err: EngineError) {
            *self.fail_with.lock().unwrap() = Some(err);
        }
    }

    impl StepCommitter for FakeCommitter {
        fn commit_completed(
            &self,
            workflow_id: &str,
            step: &str,
            attempt: u32,
            _result: Value,
            _duration_ms: u64,
        ) -> Result<(), EngineError> {
            if let Some(err) = self.fail_with.lock().unwrap().take() {
                return Err(err);
            }
            self.commits.lock().unwrap().push((
                workflow_id.to_string(),
                step.to_string(),
                attempt,
                true,
            ));
            Ok(())
        }

        fn commit_failed(
            &self,
            workflow_id: &str,
            step: &str,
            attempt: u32,
            _error: &str,
            _retryable: bool,
        ) -> Result<(), EngineError> {
            self.commits.lock().unwrap().push((
                workflow_id.to_string(),
                step.to_string(),
                attempt,
                false,
            ));
            Ok(())
        }
    }

    fn dispatcher(
        lease_duration: Duration,
        worker_timeout: Duration,
    ) -> (Arc<Dispatcher>, Arc<FakeCommitter>, Arc<TaskQueue>) {
        let queue = Arc::new(TaskQueue::new());
        let committer = Arc::new(FakeCommitter::default());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            Arc::new(LeaseManager::new()),
            Arc::clone(&committer) as Arc<dyn StepCommitter>,
            Arc::new(LogicalClock::new()),
            Arc::new(EngineCounters::new()),
            lease_duration,
            worker_timeout,
        ));
        (dispatcher, committer, queue)
    }

    #[test]
    fn request_task_binds_a_fresh_lease_and_marks_the_worker_busy() {
        let (dispatcher, _, _) = dispatcher(Duration::from_secs(30), Duration::from_secs(60));
        dispatcher.register_worker("w1");
        dispatcher.schedule_step("wf-1", "s1", 1);

        let grant = dispatcher.request_task("w1").expect("task granted");
        assert_eq!(grant.task.step, "s1");
        assert_eq!(grant.fencing_token, 1);
        assert_eq!(
            dispatcher.worker("w1").unwrap().status,
            WorkerStatus::Busy
        );
        assert!(dispatcher.request_task("w1").is_none(), "queue is empty");
    }

    #[test]
    fn accepted_report_releases_lease_and_resolves_the_task() {
        let (dispatcher, committer, queue) =
            dispatcher(Duration::from_secs(30), Duration::from_secs(60));
        dispatcher.register_worker("w1");
        dispatcher.schedule_step("wf-1", "s1", 1);
        let grant = dispatcher.request_task("w1").unwrap();

        dispatcher
            .report_completed("w1", &grant.lease_id, grant.fencing_token, Value::Null, 10)
            .unwrap();

        assert_eq!(committer.recorded(), vec![("wf-1".into(), "s1".into(), 1, true)]);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(
            dispatcher.worker("w1").unwrap().status,
            WorkerStatus::Idle
        );
    }

    #[test]
    fn stale_token_report_is_dropped_and_never_forwarded() {
        let (dispatcher, committer, _) =
            dispatcher(Duration::from_millis(50), Duration::from_secs(60));
        dispatcher.register_worker("w1");
        dispatcher.register_worker("w2");
        dispatcher.schedule_step("wf-1", "s1", 1);

        let first = dispatcher.request_task("w1").unwrap();
        // The first worker stalls; its task is requeued and re-granted.
        dispatcher.queue.requeue(&first.task.task_id);
        let second = dispatcher.request_task("w2").unwrap();
        assert_eq!(second.fencing_token, 2);

        dispatcher
            .report_completed("w2", &second.lease_id, second.fencing_token, Value::Null, 5)
            .unwrap();
        let err = dispatcher
            .report_completed("w1", &first.lease_id, first.fencing_token, Value::Null, 5)
            .unwrap_err();
        assert!(matches!(err, EngineError::FencingTokenStale { .. }));
        assert_eq!(committer.recorded().len(), 1, "stale result never forwarded");
    }

    #[test]
    fn failure_reports_flow_through_the_same_validation() {
        let (dispatcher, committer, _) =
            dispatcher(Duration::from_secs(30), Duration::from_secs(60));
        dispatcher.register_worker("w1");
        dispatcher.schedule_step("wf-1", "s1", 1);
        let grant = dispatcher.request_task("w1").unwrap();

        dispatcher
            .report_failed("w1", &grant.lease_id, grant.fencing_token, "boom", true)
            .unwrap();
        assert_eq!(
            committer.recorded(),
            vec![("wf-1".into(), "s1".into(), 1, false)]
        );
    }

    #[test]
    fn absorbed_coordinator_rejections_do_not_error_the_worker() {
        let (dispatcher, committer, queue) =
            dispatcher(Duration::from_secs(30), Duration::from_secs(60));
        dispatcher.register_worker("w1");
        dispatcher.schedule_step("wf-1", "s1", 1);
        let grant = dispatcher.request_task("w1").unwrap();

        committer.fail_next(EngineError::Duplicate { key: "k".into() });
        dispatcher
            .report_completed("w1", &grant.lease_id, grant.fencing_token, Value::Null, 5)
            .unwrap();
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(dispatcher.counters.snapshot().duplicate_commits, 1);
    }

    #[test]
    fn sweep_evicts_silent_workers_and_requeues_their_tasks() {
        let (dispatcher, _, queue) =
            dispatcher(Duration::from_secs(30), Duration::from_millis(40));
        dispatcher.register_worker("w1");
        dispatcher.schedule_step("wf-1", "s1", 1);
        let grant = dispatcher.request_task("w1").unwrap();
        assert_eq!(grant.task.attempt, 1);

        let later = Instant::now() + Duration::from_millis(100);
        assert_eq!(dispatcher.sweep_workers(later), 1);
        assert_eq!(dispatcher.worker_count(), 0);

        let requeued = queue.pull().expect("task back in the queue");
        assert_eq!(requeued.attempt, 2);
    }

    #[test]
    fn sweep_leaves_heartbeating_workers_alone() {
        let (dispatcher, _, _) = dispatcher(Duration::from_secs(30), Duration::from_secs(60));
        dispatcher.register_worker("w1");
        dispatcher.heartbeat("w1");
        assert_eq!(dispatcher.sweep_workers(Instant::now()), 0);
        assert_eq!(dispatcher.worker_count(), 1);
    }
}
