//! Engine facade: wires the WAL, coordinator registry, queue, lease manager,
//! and dispatcher into the API the outer shells (gateways, CLIs) consume.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use windlass_kernel::clock::LogicalClock;
use windlass_kernel::ids::WorkflowId;
use windlass_kernel::state::WorkflowState;
use windlass_kernel::wal::WalService;

use crate::config::EngineConfig;
use crate::coordinator::Advanced;
use crate::dispatcher::{Dispatcher, StepCommitter, StepScheduler};
use crate::error::EngineError;
use crate::lease::LeaseManager;
use crate::observability::{CounterSnapshot, EngineCounters};
use crate::queue::TaskQueue;
use crate::recovery::{self, RecoveryReport};
use crate::registry::CoordinatorRegistry;
use crate::worker::{StepHandler, WorkerRuntime};

/// The assembled engine. Each member is a single-writer owner; the facade
/// only routes requests between them.
pub struct Engine {
    config: EngineConfig,
    clock: Arc<LogicalClock>,
    wal: Arc<WalService>,
    registry: Arc<CoordinatorRegistry>,
    queue: Arc<TaskQueue>,
    leases: Arc<LeaseManager>,
    dispatcher: Arc<Dispatcher>,
    counters: Arc<EngineCounters>,
}

impl Engine {
    /// Opens the WAL under `config.data_dir` and assembles the components.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let wal = Arc::new(WalService::open(config.wal_options())?);
        let clock = Arc::new(LogicalClock::new());
        let registry = Arc::new(CoordinatorRegistry::new(
            Arc::clone(&wal),
            Arc::clone(&clock),
        ));
        let queue = Arc::new(TaskQueue::new());
        let leases = Arc::new(LeaseManager::new());
        let counters = Arc::new(EngineCounters::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&leases),
            Arc::clone(&registry) as Arc<dyn StepCommitter>,
            Arc::clone(&clock),
            Arc::clone(&counters),
            config.lease_duration,
            config.worker_timeout,
        ));
        info!(data_dir = %config.data_dir.display(), "engine opened");
        Ok(Self {
            config,
            clock,
            wal,
            registry,
            queue,
            leases,
            dispatcher,
            counters,
        })
    }

    /// Creates a workflow under a fresh id and returns it.
    pub fn create_workflow(
        &self,
        name: &str,
        input: Value,
        steps: Vec<String>,
    ) -> Result<WorkflowId, EngineError> {
        let workflow_id = Uuid::new_v4().to_string();
        self.registry
            .create_workflow(&workflow_id, name, input, steps)?;
        Ok(workflow_id)
    }

    /// Creates a workflow under a caller-chosen id (idempotent client keys,
    /// tests).
    pub fn create_workflow_with_id(
        &self,
        workflow_id: &str,
        name: &str,
        input: Value,
        steps: Vec<String>,
    ) -> Result<(), EngineError> {
        self.registry
            .create_workflow(workflow_id, name, input, steps)?;
        Ok(())
    }

    /// Advances the workflow; a scheduled step is handed to the dispatcher's
    /// queue in the same call.
    pub fn advance(&self, workflow_id: &str) -> Result<Advanced, EngineError> {
        let coordinator = self
            .registry
            .get(workflow_id)
            .ok_or_else(|| EngineError::NotFound {
                workflow_id: workflow_id.to_string(),
            })?;
        let advanced = coordinator.advance()?;
        if let Advanced::Scheduled { step, attempt } = &advanced {
            self.dispatcher.schedule_step(workflow_id, step, *attempt);
        }
        Ok(advanced)
    }

    pub fn cancel(&self, workflow_id: &str) -> Result<(), EngineError> {
        self.coordinator(workflow_id)?.cancel()
    }

    pub fn fail(
        &self,
        workflow_id: &str,
        reason: &str,
        final_step: Option<String>,
    ) -> Result<(), EngineError> {
        self.coordinator(workflow_id)?.fail(reason, final_step)
    }

    /// Snapshot of a workflow's derived state.
    pub fn workflow_state(&self, workflow_id: &str) -> Result<WorkflowState, EngineError> {
        Ok(self.coordinator(workflow_id)?.state())
    }

    /// Rebuilds all coordinators from the WAL; no writes.
    pub fn recover(&self) -> Result<RecoveryReport, EngineError> {
        recovery::recover(&self.wal, &self.registry)
    }

    /// Builds a worker bound to this engine's dispatcher with the configured
    /// poll interval and step timeout.
    pub fn worker(&self, worker_id: &str, handler: Arc<dyn StepHandler>) -> WorkerRuntime {
        WorkerRuntime::new(
            worker_id,
            Arc::clone(&self.dispatcher),
            handler,
            self.config.worker_poll_interval,
            self.config.step_execution_timeout,
        )
    }

    /// Periodic housekeeping loop: evicts silent workers and sweeps expired
    /// leases every `worker_timeout / 2` until `shutdown` flips to true.
    pub async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.worker_timeout / 2;
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.dispatcher.sweep_workers(now);
                    self.dispatcher.sweep_leases(now);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn wal(&self) -> Arc<WalService> {
        Arc::clone(&self.wal)
    }

    pub fn queue(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.queue)
    }

    pub fn leases(&self) -> Arc<LeaseManager> {
        Arc::clone(&self.leases)
    }

    pub fn clock(&self) -> Arc<LogicalClock> {
        Arc::clone(&self.clock)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    fn coordinator(
        &self,
        workflow_id: &str,
    ) -> Result<Arc<crate::coordinator::WorkflowCoordinator>, EngineError> {
        self.registry
            .get(workflow_id)
            .ok_or_else(|| EngineError::NotFound {
                workflow_id: workflow_id.to_string(),
            })
    }
}
