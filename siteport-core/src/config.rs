//! Runtime configuration.
//!
//! Defaults suit a web request behind a typical gateway timeout; every value
//! can be overridden through `SITEPORT_*` environment variables.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use crate::container::entry::MAX_FRAME_BYTES;
use crate::crypto::hex::parse_hex_array;
use crate::error::{Result, SiteportError};

pub const MIB: u64 = 1024 * 1024;

/// Per-step timeout source; call sites may override the default per step.
pub trait RetryTimeout {
    fn retry_timeout(&self, step: &str) -> f64;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DumpKey {
    Raw([u8; 32]),
    Passphrase(String),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub retry_timeout_secs: f64,
    pub step_timeouts: HashMap<String, f64>,
    /// Files above this size are never batched with other files.
    pub large_file_bytes: u64,
    /// First-run byte threshold for media packages.
    pub media_batch_bytes: u64,
    /// First-run byte threshold for plugin/theme packages.
    pub plugin_batch_bytes: u64,
    /// Floor for the throughput-derived byte threshold.
    pub min_batch_bytes: u64,
    pub frame_bytes: u64,
    pub dump_rows_per_batch: u64,
    pub rewrite_rows_per_batch: u64,
    pub table_prefix: String,
    pub max_packet_ceiling: u64,
    pub state_dir: PathBuf,
    pub dump_key: Option<DumpKey>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_timeout_secs: 18.0,
            step_timeouts: HashMap::new(),
            large_file_bytes: 10 * MIB,
            media_batch_bytes: 16 * MIB,
            plugin_batch_bytes: 64 * MIB,
            min_batch_bytes: 5 * MIB,
            frame_bytes: MIB,
            dump_rows_per_batch: 500,
            rewrite_rows_per_batch: 500,
            table_prefix: "wp_".to_string(),
            max_packet_ceiling: 1024 * MIB,
            state_dir: PathBuf::from(".siteport/state"),
            dump_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut c = Self::default();
        if let Some(v) = env_f64("SITEPORT_RETRY_TIMEOUT")? {
            c.retry_timeout_secs = v;
        }
        if let Some(v) = env_u64("SITEPORT_LARGE_FILE_BYTES")? {
            c.large_file_bytes = v;
        }
        if let Some(v) = env_u64("SITEPORT_MEDIA_BATCH_BYTES")? {
            c.media_batch_bytes = v;
        }
        if let Some(v) = env_u64("SITEPORT_PLUGIN_BATCH_BYTES")? {
            c.plugin_batch_bytes = v;
        }
        if let Some(v) = env_u64("SITEPORT_MIN_BATCH_BYTES")? {
            c.min_batch_bytes = v;
        }
        if let Some(v) = env_u64("SITEPORT_FRAME_BYTES")? {
            c.frame_bytes = v.clamp(1, MAX_FRAME_BYTES);
        }
        if let Some(v) = env_u64("SITEPORT_DUMP_ROWS")? {
            c.dump_rows_per_batch = v.max(1);
        }
        if let Some(v) = env_u64("SITEPORT_REWRITE_ROWS")? {
            c.rewrite_rows_per_batch = v.max(1);
        }
        if let Ok(v) = env::var("SITEPORT_TABLE_PREFIX") {
            c.table_prefix = v;
        }
        if let Some(v) = env_u64("SITEPORT_MAX_PACKET_CEILING")? {
            c.max_packet_ceiling = v;
        }
        if let Ok(v) = env::var("SITEPORT_STATE_DIR") {
            c.state_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SITEPORT_KEY") {
            c.dump_key = Some(DumpKey::Raw(parse_hex_array::<32>(&v)?));
        } else if let Ok(v) = env::var("SITEPORT_PASSPHRASE") {
            c.dump_key = Some(DumpKey::Passphrase(v));
        }

        const STEP_PREFIX: &str = "SITEPORT_RETRY_TIMEOUT_";
        for (key, value) in env::vars() {
            if let Some(step) = key.strip_prefix(STEP_PREFIX) {
                let secs = parse_f64(&key, &value)?;
                c.step_timeouts.insert(step.to_ascii_lowercase(), secs);
            }
        }
        Ok(c)
    }

    pub fn with_step_timeout(mut self, step: &str, secs: f64) -> Self {
        self.step_timeouts.insert(step.to_string(), secs);
        self
    }
}

impl RetryTimeout for Config {
    fn retry_timeout(&self, step: &str) -> f64 {
        self.step_timeouts
            .get(step)
            .copied()
            .unwrap_or(self.retry_timeout_secs)
    }
}

fn parse_f64(key: &str, value: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|e| SiteportError::Config(format!("{key}={value}: {e}")))
}

fn env_f64(key: &str) -> Result<Option<f64>> {
    env::var(key).ok().map(|v| parse_f64(key, &v)).transpose()
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    env::var(key)
        .ok()
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| SiteportError::Config(format!("{key}={v}: {e}")))
        })
        .transpose()
}
