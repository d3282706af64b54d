// src/runs/sweep.rs

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::runs::manager::RunManager;

/// Periodically fail runs stuck in `running`, until `shutdown` fires.
pub fn spawn_run_sweeper(
    manager: Arc<RunManager>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("run sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let swept = manager.sweep_stuck(Utc::now());
                    if !swept.is_empty() {
                        info!(count = swept.len(), "failed runs past their timeout");
                    }
                }
            }
        }
    })
}
