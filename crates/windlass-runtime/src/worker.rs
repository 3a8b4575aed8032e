//! Worker runtime: polls the dispatcher, executes the user-provided step
//! handler under a hard timeout, and reports the outcome with the lease it
//! was issued.
//!
//! A worker may die at any time; its in-flight result is forfeit and the
//! lease/fencing machinery makes the loss safe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use windlass_kernel::ids::WorkflowId;

use crate::dispatcher::Dispatcher;
use crate::models::TaskGrant;

/// Inputs handed to a step handler alongside the step name.
#[derive(Clone, Debug)]
pub struct StepContext {
    pub workflow_id: WorkflowId,
    pub attempt: u32,
}

/// Failure returned by a step handler.
#[derive(Clone, Debug)]
pub struct StepFailure {
    pub message: String,
    pub retryable: bool,
}

impl StepFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// User-provided step logic. Handlers run outside the core process's trust
/// boundary: whatever they return is validated before it can commit.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, step: &str, ctx: StepContext) -> Result<Value, StepFailure>;
}

/// One polling worker bound to a dispatcher.
pub struct WorkerRuntime {
    worker_id: String,
    dispatcher: Arc<Dispatcher>,
    handler: Arc<dyn StepHandler>,
    poll_interval: Duration,
    step_timeout: Duration,
}

impl WorkerRuntime {
    pub fn new(
        worker_id: impl Into<String>,
        dispatcher: Arc<Dispatcher>,
        handler: Arc<dyn StepHandler>,
        poll_interval: Duration,
        step_timeout: Duration,
    ) -> Self {
        let worker_id = worker_id.into();
        dispatcher.register_worker(&worker_id);
        Self {
            worker_id,
            dispatcher,
            handler,
            poll_interval,
            step_timeout,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// One explicit poll: requests a task and, if granted, executes and
    /// reports it. Returns whether a task ran.
    pub async fn poll_now(&self) -> bool {
        match self.dispatcher.request_task(&self.worker_id) {
            Some(grant) => {
                self.execute(grant).await;
                true
            }
            None => false,
        }
    }

    /// Polls at the configured interval until `shutdown` flips to true.
    /// Each tick drains the queue before sleeping again.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    while self.poll_now().await {}
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(worker_id = %self.worker_id, "worker shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn execute(&self, grant: TaskGrant) {
        let ctx = StepContext {
            workflow_id: grant.task.workflow_id.clone(),
            attempt: grant.task.attempt,
        };
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.step_timeout,
            self.handler.handle(&grant.task.step, ctx),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let report = match outcome {
            Ok(Ok(output)) => self.dispatcher.report_completed(
                &self.worker_id,
                &grant.lease_id,
                grant.fencing_token,
                output,
                duration_ms,
            ),
            Ok(Err(failure)) => self.dispatcher.report_failed(
                &self.worker_id,
                &grant.lease_id,
                grant.fencing_token,
                &failure.message,
                failure.retryable,
            ),
            Err(_elapsed) => self.dispatcher.report_failed(
                &self.worker_id,
                &grant.lease_id,
                grant.fencing_token,
                "step execution timed out",
                true,
            ),
        };
        if let Err(err) = report {
            // The result is forfeit; the lease machinery already made the
            // loss safe.
            warn!(
                worker_id = %self.worker_id,
                step = %grant.task.step,
                error = %err,
                "report rejected"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use windlass_kernel::clock::LogicalClock;

    use crate::dispatcher::{StepCommitter, StepScheduler};
    use crate::error::EngineError;
    use crate::lease::LeaseManager;
    use crate::observability::EngineCounters;
    use crate::queue::TaskQueue;

    #[derive(Default)]
    struct RecordingCommitter {
        completed: Mutex<Vec<(String, String, u32)>>,
        failed: Mutex<Vec<(String, String, bool)>>,
    }

    impl StepCommitter for RecordingCommitter {
        fn commit_completed(
            &self,
            workflow_id: &str,
            step: &str,
            attempt: u32,
            _result: Value,
            _duration_ms: u64,
        ) -> Result<(), EngineError> {
            self.completed.lock().unwrap().push((
                workflow_id.to_string(),
                step.to_string(),
                attempt,
            ));
            Ok(())
        }

        fn commit_failed(
            &self,
            workflow_id: &str,
            step: &str,
            _attempt: u32,
            error: &str,
            retryable: bool,
        ) -> Result<(), EngineError> {
            self.failed.lock().unwrap().push((
                workflow_id.to_string(),
                error.to_string(),
                retryable,
            ));
            Ok(())
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl StepHandler for EchoHandler {
        async fn handle(&self, step: &str, ctx: StepContext) -> Result<Value, StepFailure> {
            Ok(serde_json::json!({"step": step, "attempt": ctx.attempt}))
        }
    }

    struct StallingHandler;

    #[async_trait]
    impl StepHandler for StallingHandler {
        async fn handle(&self, _step: &str, _ctx: StepContext) -> Result<Value, StepFailure> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("handler is expected to be timed out")
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl StepHandler for FailingHandler {
        async fn handle(&self, _step: &str, _ctx: StepContext) -> Result<Value, StepFailure> {
            Err(StepFailure::fatal("no such account"))
        }
    }

    fn dispatcher_with(committer: Arc<dyn StepCommitter>) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(TaskQueue::new()),
            Arc::new(LeaseManager::new()),
            committer,
            Arc::new(LogicalClock::new()),
            Arc::new(EngineCounters::new()),
            Duration::from_secs(30),
            Duration::from_secs(60),
        ))
    }

    #[tokio::test]
    async fn poll_executes_and_reports_completion() {
        let committer = Arc::new(RecordingCommitter::default());
        let dispatcher = dispatcher_with(Arc::clone(&committer) as Arc<dyn StepCommitter>);
        dispatcher.schedule_step("wf-1", "s1", 1);

        let worker = WorkerRuntime::new(
            "w1",
            dispatcher,
            Arc::new(EchoHandler),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        assert!(worker.poll_now().await);
        assert!(!worker.poll_now().await, "queue drained");
        assert_eq!(
            committer.completed.lock().unwrap().as_slice(),
            &[("wf-1".to_string(), "s1".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn handler_failures_are_reported_with_retryability() {
        let committer = Arc::new(RecordingCommitter::default());
        let dispatcher = dispatcher_with(Arc::clone(&committer) as Arc<dyn StepCommitter>);
        dispatcher.schedule_step("wf-1", "s1", 1);

        let worker = WorkerRuntime::new(
            "w1",
            dispatcher,
            Arc::new(FailingHandler),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        assert!(worker.poll_now().await);
        assert_eq!(
            committer.failed.lock().unwrap().as_slice(),
            &[("wf-1".to_string(), "no such account".to_string(), false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handler_hits_the_hard_timeout() {
        let committer = Arc::new(RecordingCommitter::default());
        let dispatcher = dispatcher_with(Arc::clone(&committer) as Arc<dyn StepCommitter>);
        dispatcher.schedule_step("wf-1", "s1", 1);

        let worker = WorkerRuntime::new(
            "w1",
            dispatcher,
            Arc::new(StallingHandler),
            Duration::from_millis(10),
            Duration::from_millis(25),
        );
        assert!(worker.poll_now().await);
        let failed = committer.failed.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].1, "step execution timed out");
        assert!(failed[0].2, "timeouts are retryable");
    }

    #[tokio::test]
    async fn run_drains_until_shutdown() {
        let committer = Arc::new(RecordingCommitter::default());
        let dispatcher = dispatcher_with(Arc::clone(&committer) as Arc<dyn StepCommitter>);
        dispatcher.schedule_step("wf-1", "s1", 1);
        dispatcher.schedule_step("wf-1", "s2", 1);

        let worker = Arc::new(WorkerRuntime::new(
            "w1",
            dispatcher,
            Arc::new(EchoHandler),
            Duration::from_millis(5),
            Duration::from_secs(1),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(rx).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(committer.completed.lock().unwrap().len(), 2);
    }
}
