//! Runtime configuration. Every setting can come from a flag or a
//! `LABBOOK_*` environment variable; flags win.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

pub const WAL_FILE_NAME: &str = "reservations.wal";

#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Directory holding the reservation WAL
    #[arg(long, env = "LABBOOK_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Compact the WAL once this many events were appended since the last compaction
    #[arg(long, env = "LABBOOK_COMPACT_THRESHOLD", default_value_t = 1000)]
    pub compact_threshold: u64,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "LABBOOK_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Default tracing filter, overridden by RUST_LOG
    #[arg(long, env = "LABBOOK_LOG", default_value = "info")]
    pub log: String,

    /// Deadline for a single store operation, in milliseconds
    #[arg(long, env = "LABBOOK_OP_TIMEOUT_MS", default_value_t = 5000)]
    pub op_timeout_ms: u64,
}

impl Config {
    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}
