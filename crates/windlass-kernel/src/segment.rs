//! Append-only WAL segment files.
//!
//! Entry framing, bit-exact:
//!
//! ```text
//! offset  size    field
//!  0      4       payload_length     (big-endian u32)
//!  4      4       crc32(payload)     (big-endian u32, IEEE polynomial)
//!  8      8       timestamp          (big-endian u64, logical clock)
//! 16      N       payload            (serialized event bytes)
//! ```
//!
//! Appends flush OS buffers to stable storage before returning success; a
//! failed append must be treated as not having happened. Readers stop
//! cleanly on a zero-byte tail, an incomplete trailing frame, or a CRC
//! mismatch; on mismatch the entry and everything after it in that segment
//! is dropped (the durability contract says the last entry before the
//! mismatch survived).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::WalError;

/// Fixed frame header size: length(4) + crc32(4) + timestamp(8).
pub const ENTRY_HEADER_SIZE: usize = 16;

/// Default maximum segment size before rotation: 64 MiB.
pub const DEFAULT_SEGMENT_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// File name for a segment id, e.g. `segment_00000001.wal`.
pub fn segment_file_name(segment_id: u64) -> String {
    format!("segment_{:08}.wal", segment_id)
}

/// Parses a segment id back out of a file name produced by
/// [segment_file_name]; `None` for anything else in the directory.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let id = name.strip_prefix("segment_")?.strip_suffix(".wal")?;
    if id.len() != 8 {
        return None;
    }
    id.parse().ok()
}

/// True when writing the next entry would meet or exceed `max_size`.
pub fn needs_rotation(current_size: u64, incoming_size: u64, max_size: u64) -> bool {
    current_size + incoming_size >= max_size
}

/// Builds the framed bytes for one entry.
pub fn encode_frame(payload: &[u8], timestamp: u64) -> Vec<u8> {
    let crc = crc32fast::hash(payload);
    let mut frame = Vec::with_capacity(ENTRY_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(&timestamp.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Outcome of decoding one frame from the head of `buf`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameDecode {
    /// A whole, checksum-valid frame.
    Complete {
        timestamp: u64,
        payload: Vec<u8>,
        consumed: usize,
    },
    /// A zero-byte tail or a frame cut short by a partial write.
    Incomplete,
    /// The frame is whole but its payload fails the CRC check.
    Corrupted { reason: String },
}

/// Decodes the frame at the head of `buf` without consuming it.
pub fn decode_frame(buf: &[u8]) -> FrameDecode {
    if buf.len() < ENTRY_HEADER_SIZE {
        return FrameDecode::Incomplete;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let stored_crc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let timestamp = u64::from_be_bytes([
        buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
    ]);
    if buf.len() < ENTRY_HEADER_SIZE + len {
        return FrameDecode::Incomplete;
    }
    let payload = &buf[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + len];
    let computed_crc = crc32fast::hash(payload);
    if computed_crc != stored_crc {
        return FrameDecode::Corrupted {
            reason: format!("crc mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"),
        };
    }
    FrameDecode::Complete {
        timestamp,
        payload: payload.to_vec(),
        consumed: ENTRY_HEADER_SIZE + len,
    }
}

/// One decoded entry, with the byte offset of its frame within the segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentEntry {
    pub offset: u64,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

/// Damage found at the tail of a segment during a scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentDamage {
    pub offset: u64,
    pub reason: String,
}

/// Result of scanning a segment: the intact prefix plus any tail damage.
#[derive(Clone, Debug, Default)]
pub struct SegmentScan {
    pub entries: Vec<SegmentEntry>,
    /// Bytes covered by intact entries (scan position where damage starts).
    pub valid_len: u64,
    pub damage: Option<SegmentDamage>,
}

/// Streams all entries of a segment, stopping at the first damaged frame.
pub fn read_all(dir: &Path, segment_id: u64) -> Result<SegmentScan, WalError> {
    let path = dir.join(segment_file_name(segment_id));
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SegmentScan::default()),
        Err(e) => return Err(WalError::DiskFailure(e)),
    };

    let mut scan = SegmentScan::default();
    let mut pos = 0usize;
    while pos < bytes.len() {
        match decode_frame(&bytes[pos..]) {
            FrameDecode::Complete {
                timestamp,
                payload,
                consumed,
            } => {
                scan.entries.push(SegmentEntry {
                    offset: pos as u64,
                    timestamp,
                    payload,
                });
                pos += consumed;
            }
            FrameDecode::Incomplete => {
                scan.damage = Some(SegmentDamage {
                    offset: pos as u64,
                    reason: "incomplete trailing frame".into(),
                });
                break;
            }
            FrameDecode::Corrupted { reason } => {
                scan.damage = Some(SegmentDamage {
                    offset: pos as u64,
                    reason,
                });
                break;
            }
        }
    }
    scan.valid_len = pos as u64;
    Ok(scan)
}

/// An open segment file in append mode. Immutable once rotated away from.
#[derive(Debug)]
pub struct Segment {
    id: u64,
    path: PathBuf,
    file: File,
    size: u64,
    max_size: u64,
    fsync_on_write: bool,
}

impl Segment {
    /// Opens or creates the segment in append mode.
    pub fn open(
        dir: &Path,
        segment_id: u64,
        max_size: u64,
        fsync_on_write: bool,
    ) -> Result<Self, WalError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(segment_file_name(segment_id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            id: segment_id,
            path,
            file,
            size,
            max_size,
            fsync_on_write,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when appending a payload of `payload_len` bytes would meet or
    /// exceed the segment's maximum size.
    pub fn needs_rotation(&self, payload_len: usize) -> bool {
        needs_rotation(
            self.size,
            (ENTRY_HEADER_SIZE + payload_len) as u64,
            self.max_size,
        )
    }

    /// Appends one framed entry and syncs it to stable storage before
    /// returning. On error the entry must be treated as not written.
    pub fn append(&mut self, payload: &[u8], timestamp: u64) -> Result<u64, WalError> {
        let frame = encode_frame(payload, timestamp);
        self.file.write_all(&frame)?;
        if self.fsync_on_write {
            self.file.sync_all()?;
        }
        self.size += frame.len() as u64;
        Ok(self.size)
    }
}
