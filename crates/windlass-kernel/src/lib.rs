//! Event-sourced durability kernel for the windlass workflow engine.
//!
//! The write-ahead log is the sole source of truth. Every state change is an
//! appended event, fsync'd before acknowledgment; all workflow state is
//! derived by folding events. Constraints: appends are serialized so fsync
//! order equals commit order; per-workflow sequences are dense and strictly
//! increasing; the fold is pure.

pub mod clock;
pub mod error;
pub mod event;
pub mod ids;
pub mod replay;
pub mod segment;
pub mod state;
pub mod trace;
pub mod wal;

pub use clock::LogicalClock;
pub use error::WalError;
pub use event::{derive_idempotency_key, Event, EventPayload, EventType, METADATA_IDEMPOTENCY_KEY};
pub use ids::{EventId, FencingToken, Seq, StepName, WorkflowId};
pub use replay::{event_stream_hash, verify_replay};
pub use segment::{decode_frame, encode_frame, needs_rotation, FrameDecode, Segment, SegmentScan};
pub use state::{hydrate, StepState, StepStatus, WorkflowState, WorkflowStatus};
pub use trace::WorkflowTraceEvent;
pub use wal::{WalNotification, WalOptions, WalService};
