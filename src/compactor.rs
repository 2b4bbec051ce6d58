use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

/// Background task that compacts the WAL whenever it has grown by `threshold`
/// appends. Runs until the task is aborted.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        match engine.compact_if_needed(threshold).await {
            Ok(true) => info!("compactor: WAL compacted"),
            Ok(false) => {}
            Err(e) => warn!("compactor: {e}"),
        }
    }
}
