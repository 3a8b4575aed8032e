//! Replay verification: deterministic hashing of an event stream.
//!
//! Used to witness the deterministic-fold contract: two replays of the same
//! workflow must produce byte-identical event streams, so their hashes must
//! match. A mismatch is a named error, not a panic.

use sha2::{Digest, Sha256};

use crate::error::WalError;
use crate::event::Event;

/// SHA-256 over the canonical serialized event sequence.
pub fn event_stream_hash(events: &[Event]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for event in events {
        let canonical = serde_json::to_string(event).unwrap_or_default();
        hasher.update(canonical.as_bytes());
    }
    hasher.finalize().into()
}

/// Verifies that `events` hash to `expected`; `ReplayMismatch` otherwise.
pub fn verify_replay(
    workflow_id: &str,
    events: &[Event],
    expected: &[u8; 32],
) -> Result<(), WalError> {
    let actual = event_stream_hash(events);
    if actual != *expected {
        return Err(WalError::ReplayMismatch {
            workflow_id: workflow_id.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use serde_json::json;

    fn events() -> Vec<Event> {
        vec![
            Event::new(
                "wf-1",
                0,
                1,
                EventPayload::WorkflowCreated {
                    name: "flow".into(),
                    input: json!({}),
                    steps: vec!["s1".into()],
                },
            ),
            Event::new(
                "wf-1",
                1,
                2,
                EventPayload::StepScheduled {
                    step: "s1".into(),
                    attempt: 1,
                },
            ),
        ]
    }

    #[test]
    fn hash_is_stable_for_equal_streams() {
        let stream = events();
        assert_eq!(event_stream_hash(&stream), event_stream_hash(&stream));
        assert!(verify_replay("wf-1", &stream, &event_stream_hash(&stream)).is_ok());
    }

    #[test]
    fn hash_changes_when_the_stream_changes() {
        let stream = events();
        let expected = event_stream_hash(&stream);
        let truncated = &stream[..1];
        let err = verify_replay("wf-1", truncated, &expected).unwrap_err();
        assert!(matches!(err, WalError::ReplayMismatch { .. }));
    }
}
