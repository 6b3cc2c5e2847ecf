//! Centralized configuration for the transfer engines.
//!
//! All tunable parameters live here so they can be reviewed and adjusted in
//! a single place. Wire-format constants (protobuf field tags) stay in the
//! `wire` module.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Well-known application port for Akita datagrams.
///
/// Inbound packets on any other port are not ours and are dropped by the
/// dispatcher before decoding.
pub const AKITA_CONTENT_TYPE: u16 = 123;

/// Default piece size in bytes, sized to fit a single mesh datagram after
/// protobuf framing overhead.
pub const DEFAULT_PIECE_SIZE: u32 = 200;

/// Default encoded-datagram budget in bytes. Resume requests are truncated
/// so their encoding never exceeds this.
pub const DEFAULT_MAX_DATAGRAM_BYTES: usize = 236;

/// Tuning knobs for both engines.
///
/// The defaults are conservative: a mesh link measured in single-digit
/// kilobits per second with multi-second latency. Embedders on faster links
/// should shrink the delays and grow `piece_size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bytes per piece. Every piece except possibly the last has exactly
    /// this length.
    pub piece_size: u32,
    /// Whether the sender computes and announces a Merkle root in addition
    /// to the per-piece hash list.
    pub use_merkle: bool,
    /// Starting inter-piece delay at the sender.
    pub initial_delay: Duration,
    /// Ceiling for the inter-piece delay under loss-driven backoff.
    pub max_delay: Duration,
    /// Multiplier applied to the delay when backoff triggers.
    pub backoff_factor: f64,
    /// Consecutive lossy resume requests observed before the delay backs off.
    pub retry_threshold: u32,
    /// Per-piece cap on resume-request emissions before the receive
    /// transfer is abandoned.
    pub max_retries: u16,
    /// Cadence of the receiver's periodic resume requests.
    pub request_interval: Duration,
    /// Send transfer is abandoned when no resume request arrives within
    /// this window after the last transmission.
    pub send_idle_timeout: Duration,
    /// Receive transfer is abandoned when no piece arrives within this
    /// window.
    pub receive_idle_timeout: Duration,
    /// Consecutive transport send failures before a send transfer fails.
    pub max_send_errors: u32,
    /// Encoded-size budget for a single outbound datagram.
    pub max_datagram_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            piece_size: DEFAULT_PIECE_SIZE,
            use_merkle: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            retry_threshold: 3,
            max_retries: 10,
            request_interval: Duration::from_secs(10),
            send_idle_timeout: Duration::from_secs(300),
            receive_idle_timeout: Duration::from_secs(300),
            max_send_errors: 5,
            max_datagram_bytes: DEFAULT_MAX_DATAGRAM_BYTES,
        }
    }
}

impl Config {
    /// Load a configuration from a JSON file. Missing fields fall back to
    /// their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Persist the configuration as JSON via a write-to-temp-then-rename,
    /// so a crash mid-write never leaves a truncated file behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let content = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content.as_bytes())
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            anyhow::anyhow!("failed to rename {} to {}: {e}", tmp_path.display(), path.display())
        })?;
        Ok(())
    }
}
