//! Workflow control plane for the windlass engine.
//!
//! Each component here is a single-writer owner of its mutable state: every
//! workflow coordinator, the lease manager, the task queue, and the
//! dispatcher. Cross-owner operations are requests with responses; the WAL
//! is written before any in-memory state changes.

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod lease;
pub mod models;
pub mod observability;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod worker;

pub use config::EngineConfig;
pub use coordinator::{Advanced, WorkflowCoordinator};
pub use dispatcher::{Dispatcher, StepCommitter, StepScheduler};
pub use engine::Engine;
pub use error::EngineError;
pub use lease::{LeaseCheck, LeaseManager};
pub use models::{Lease, Task, TaskGrant, WorkerRecord, WorkerStatus};
pub use observability::{CounterSnapshot, EngineCounters, RejectionReason};
pub use queue::TaskQueue;
pub use recovery::{recover, RecoveryReport};
pub use registry::CoordinatorRegistry;
pub use worker::{StepContext, StepFailure, StepHandler, WorkerRuntime};
