//! Identity types for the windlass kernel.
//!
//! WorkflowId is the partition key of the log; StepName identifies one step
//! within a workflow's ordered step list; Seq is the per-workflow dense event
//! sequence number, starting at 0 for `workflow_created`.

/// Identifies one workflow; partition key for every event.
pub type WorkflowId = String;

/// Name of a step within a workflow's ordered step list.
pub type StepName = String;

/// Per-workflow dense, strictly increasing event sequence number.
pub type Seq = u64;

/// Globally unique event identifier (UUID v4, hyphenated).
pub type EventId = String;

/// Monotonically increasing token per (workflow, step); rejects commits from
/// superseded leases.
pub type FencingToken = u64;
