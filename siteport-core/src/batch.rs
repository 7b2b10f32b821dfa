//! Byte thresholds shared by the archive extractor and writer.

use crate::config::Config;
use crate::container::entry::MAX_FRAME_BYTES;
use crate::container::meta::ArchiveKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchPolicy {
    /// A file above this size is never combined with another file in one batch.
    pub large_file_bytes: u64,
    /// Threshold used before any throughput has been measured.
    pub first_run_batch_bytes: u64,
    pub min_batch_bytes: u64,
    pub frame_bytes: u64,
}

impl BatchPolicy {
    pub fn from_config(cfg: &Config, kind: ArchiveKind) -> Self {
        let first_run_batch_bytes = match kind {
            ArchiveKind::Media => cfg.media_batch_bytes,
            ArchiveKind::Plugin => cfg.plugin_batch_bytes,
        };
        Self {
            large_file_bytes: cfg.large_file_bytes,
            first_run_batch_bytes,
            min_batch_bytes: cfg.min_batch_bytes,
            frame_bytes: cfg.frame_bytes.clamp(1, MAX_FRAME_BYTES),
        }
    }

    pub fn is_large(&self, size: u64) -> bool {
        size > self.large_file_bytes
    }

    /// Threshold for this batch: the measured one if any, else the first-run default.
    pub fn threshold(&self, saved: Option<u64>) -> u64 {
        saved.unwrap_or(self.first_run_batch_bytes)
    }

    /// Bytes the next batch may move, from this batch's observed throughput.
    /// Keeps the previous value when nothing measurable happened.
    pub fn next_batch_bytes(&self, bytes: u64, elapsed: f64, timeout: f64, previous: u64) -> u64 {
        if bytes == 0 || elapsed <= 0.0 || !timeout.is_finite() {
            return previous.max(self.min_batch_bytes);
        }
        let rate = bytes as f64 / elapsed;
        let projected = (rate * timeout) as u64;
        projected.max(self.min_batch_bytes)
    }
}
