//! Engine configuration surface.

use std::path::PathBuf;
use std::time::Duration;

use windlass_kernel::wal::WalOptions;

/// Tuning knobs for the engine. Durations are stored as [Duration]; the
/// builder methods take milliseconds to match the configuration surface.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub segment_max_bytes: u64,
    pub fsync_on_write: bool,
    pub lease_duration: Duration,
    pub worker_timeout: Duration,
    pub worker_poll_interval: Duration,
    pub step_execution_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("windlass-data"),
            segment_max_bytes: 64 * 1024 * 1024,
            fsync_on_write: true,
            lease_duration: Duration::from_millis(30_000),
            worker_timeout: Duration::from_millis(60_000),
            worker_poll_interval: Duration::from_millis(1_000),
            step_execution_timeout: Duration::from_millis(30_000),
        }
    }
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
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

    pub fn with_lease_duration_ms(mut self, ms: u64) -> Self {
        self.lease_duration = Duration::from_millis(ms);
        self
    }

    pub fn with_worker_timeout_ms(mut self, ms: u64) -> Self {
        self.worker_timeout = Duration::from_millis(ms);
        self
    }

    pub fn with_worker_poll_interval_ms(mut self, ms: u64) -> Self {
        self.worker_poll_interval = Duration::from_millis(ms);
        self
    }

    pub fn with_step_execution_timeout_ms(mut self, ms: u64) -> Self {
        self.step_execution_timeout = Duration::from_millis(ms);
        self
    }

    pub(crate) fn wal_options(&self) -> WalOptions {
        WalOptions::new(&self.data_dir)
            .with_segment_max_bytes(self.segment_max_bytes)
            .with_fsync_on_write(self.fsync_on_write)
    }
}
