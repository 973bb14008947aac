// src/housekeeping/scheduler.rs
// Timer-driven housekeeping: scheduled cadence plus a record-count
// threshold trigger. A tick failure is logged and never reaches the
// primary read/write paths.

use super::policy;
use crate::engine::MemoryEngine;
use crate::error::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How often the scheduler wakes to close idle conversations and check its
/// triggers. The flush cadence itself comes from config.
const POLL_SECS: u64 = 60;

/// Spawn the background housekeeping task.
///
/// Each poll closes idle conversations, then runs a flush when either the
/// configured cadence has elapsed or the live pattern count crossed the
/// trigger threshold.
pub fn spawn_housekeeping_scheduler(engine: Arc<MemoryEngine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_flush = Instant::now();
        loop {
            let interval = engine.config().read().await.housekeeping.interval_secs;
            let poll = Duration::from_secs(POLL_SECS.min(interval).max(1));
            tokio::time::sleep(poll).await;

            if let Err(err) = tick(&engine, &mut last_flush).await {
                warn!("Housekeeping tick failed: {err:#}");
            }
        }
    })
}

async fn tick(engine: &Arc<MemoryEngine>, last_flush: &mut Instant) -> Result<()> {
    engine.working().close_idle().await?;

    let hk = engine.config().read().await.housekeeping.clone();
    let due = last_flush.elapsed() >= Duration::from_secs(hk.interval_secs);
    let over_threshold = engine
        .knowledge()
        .pool()
        .interact_raw(move |conn| policy::over_pattern_threshold_sync(conn, &hk))
        .await?;

    if !due && !over_threshold {
        return Ok(());
    }
    if over_threshold {
        info!("Live pattern count crossed the flush threshold; running housekeeping early");
    }

    let report = engine.run_housekeeping(false, false).await?;
    info!(
        "Scheduled housekeeping finished: {} ({} deletes, {} merges)",
        report.status.as_str(),
        report.patterns_deleted + report.conversations_deleted,
        report.patterns_merged,
    );
    *last_flush = Instant::now();
    Ok(())
}
