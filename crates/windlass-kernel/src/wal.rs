//! WAL service: the single writer that mediates all appends.
//!
//! Appends are serialized under one owner so fsync order equals commit
//! order. On success the returned offset (cumulative byte position after the
//! entry) is final and stable across restarts. On failure the caller MUST
//! NOT apply the event to any in-memory state.
//!
//! Subscribers receive notifications after successful sync, in append order.
//! Delivery is best-effort: dead subscribers are silently pruned, and a
//! subscriber that needs gap-free delivery must also replay.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::WalError;
use crate::event::Event;
use crate::ids::WorkflowId;
use crate::segment::{self, Segment, SegmentScan, DEFAULT_SEGMENT_MAX_BYTES};

/// WAL tuning knobs.
#[derive(Clone, Debug)]
pub struct WalOptions {
    pub data_dir: PathBuf,
    pub segment_max_bytes: u64,
    pub fsync_on_write: bool,
}

impl WalOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            segment_max_bytes: DEFAULT_SEGMENT_MAX_BYTES,
            fsync_on_write: true,
        }
    }

    pub fn with_segment_max_bytes(mut self, segment_max_bytes: u64) -> Self {
        self.segment_max_bytes = segment_max_bytes;
        self
    }

    pub fn with_fsync_on_write(mut self, fsync_on_write: bool) -> Self {
        self.fsync_on_write = fsync_on_write;
        self
    }
}

/// Notification delivered to subscribers after a successful append.
#[derive(Clone, Debug)]
pub struct WalNotification {
    pub offset: u64,
    pub event: Event,
}

struct WalInner {
    active: Segment,
    /// Sum of the sizes of all sealed segments; the active segment's size is
    /// added on top for offset accounting.
    base_offset: u64,
    subscribers: Vec<mpsc::UnboundedSender<WalNotification>>,
}

/// Single-writer WAL service over a directory of segment files.
pub struct WalService {
    dir: PathBuf,
    segment_max_bytes: u64,
    fsync_on_write: bool,
    inner: Mutex<WalInner>,
}

impl WalService {
    /// Opens the log: scans the directory for segments, picks the highest id
    /// as active (else 0), and verifies the active segment's tail. A corrupt
    /// or truncated tail seals that segment and rotates so new appends land
    /// in a fresh segment id.
    pub fn open(options: WalOptions) -> Result<Self, WalError> {
        std::fs::create_dir_all(&options.data_dir)?;
        let ids = list_segment_ids(&options.data_dir)?;
        let mut active_id = ids.last().copied().unwrap_or(0);

        let mut base_offset = 0u64;
        for &id in &ids {
            if id != active_id {
                base_offset += segment_size(&options.data_dir, id)?;
            }
        }

        let tail = segment::read_all(&options.data_dir, active_id)?;
        if let Some(damage) = &tail.damage {
            warn!(
                segment_id = active_id,
                offset = damage.offset,
                reason = %damage.reason,
                "damaged tail in active segment, sealing and rotating"
            );
            base_offset += segment_size(&options.data_dir, active_id)?;
            active_id += 1;
        }

        let active = Segment::open(
            &options.data_dir,
            active_id,
            options.segment_max_bytes,
            options.fsync_on_write,
        )?;
        info!(
            segments = ids.len().max(1),
            active_segment = active_id,
            offset = base_offset + active.size(),
            "wal opened"
        );

        Ok(Self {
            dir: options.data_dir,
            segment_max_bytes: options.segment_max_bytes,
            fsync_on_write: options.fsync_on_write,
            inner: Mutex::new(WalInner {
                active,
                base_offset,
                subscribers: Vec::new(),
            }),
        })
    }

    /// Serializes and appends one event, rotating first when the entry would
    /// overflow the active segment. Blocks until the entry is synced.
    pub fn append(&self, event: &Event) -> Result<u64, WalError> {
        let payload = event.to_bytes()?;
        let mut inner = self.lock_inner();

        if inner.active.needs_rotation(payload.len()) && inner.active.size() > 0 {
            let next_id = inner.active.id() + 1;
            // Open the new segment before retiring the old one so a rotation
            // failure leaves the previous active segment in place.
            let next = Segment::open(&self.dir, next_id, self.segment_max_bytes, self.fsync_on_write)?;
            inner.base_offset += inner.active.size();
            inner.active = next;
            info!(segment_id = next_id, "wal segment rotated");
        }

        let active_size = inner.active.append(&payload, event.timestamp)?;
        let offset = inner.base_offset + active_size;
        debug!(
            workflow_id = %event.workflow_id,
            sequence = event.sequence,
            event_type = %event.event_type(),
            offset,
            "event appended"
        );

        let notification = WalNotification {
            offset,
            event: event.clone(),
        };
        inner
            .subscribers
            .retain(|tx| tx.send(notification.clone()).is_ok());
        Ok(offset)
    }

    /// Returns the decoded events for one workflow, in sequence order.
    /// Deterministic; corruption truncates the damaged segment and is
    /// reported by logs, not by an error.
    pub fn replay(&self, workflow_id: &str) -> Result<Vec<Event>, WalError> {
        let mut events: Vec<Event> = self
            .replay_all()?
            .into_iter()
            .filter(|e| e.workflow_id == workflow_id)
            .collect();
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    /// All decoded events across all segments, in append order.
    pub fn replay_all(&self) -> Result<Vec<Event>, WalError> {
        let _inner = self.lock_inner();
        let mut events = Vec::new();
        for id in list_segment_ids(&self.dir)? {
            let scan = segment::read_all(&self.dir, id)?;
            log_damage(id, &scan);
            for entry in scan.entries {
                match Event::from_bytes(&entry.payload) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!(
                        segment_id = id,
                        offset = entry.offset,
                        error = %e,
                        "undecodable entry skipped during replay"
                    ),
                }
            }
        }
        Ok(events)
    }

    /// Distinct workflow ids present in the log, in first-seen order.
    pub fn workflow_ids(&self) -> Result<Vec<WorkflowId>, WalError> {
        let mut seen = BTreeSet::new();
        let mut ids = Vec::new();
        for event in self.replay_all()? {
            if seen.insert(event.workflow_id.clone()) {
                ids.push(event.workflow_id);
            }
        }
        Ok(ids)
    }

    /// Registers a subscriber. Notifications match append order; delivery is
    /// best-effort and closed receivers are pruned on the next append.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WalNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_inner().subscribers.push(tx);
        rx
    }

    /// Last stable offset: cumulative size of everything synced so far.
    pub fn current_offset(&self) -> u64 {
        let inner = self.lock_inner();
        inner.base_offset + inner.active.size()
    }

    /// Id of the segment currently receiving appends.
    pub fn active_segment_id(&self) -> u64 {
        self.lock_inner().active.id()
    }

    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, WalInner> {
        // The WAL owner never panics while holding the lock with state half
        // applied; recover the guard rather than poisoning every caller.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn log_damage(segment_id: u64, scan: &SegmentScan) {
    if let Some(damage) = &scan.damage {
        warn!(
            segment_id,
            offset = damage.offset,
            reason = %damage.reason,
            surviving_entries = scan.entries.len(),
            "segment damage: dropping entry and everything after it"
        );
    }
}

fn list_segment_ids(dir: &Path) -> Result<Vec<u64>, WalError> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = segment::parse_segment_file_name(&entry.file_name().to_string_lossy()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn segment_size(dir: &Path, segment_id: u64) -> Result<u64, WalError> {
    let path = dir.join(segment::segment_file_name(segment_id));
    match std::fs::metadata(&path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(WalError::DiskFailure(e)),
    }
}
