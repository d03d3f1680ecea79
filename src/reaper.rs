use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use tracing::{debug, error, info};

use crate::engine::{Engine, EngineError};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}

/// Compact if at least `threshold` appends landed since the last compaction.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!(appends, "compacted WAL");
    Ok(true)
}

/// Background task that marks approved bookings older than the grace period as no-shows.
pub async fn run_no_show_sweeper(engine: Arc<Engine>, grace_days: u32, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match sweep_no_shows(&engine, grace_days).await {
            Ok(0) => debug!("no-show sweep: nothing to mark"),
            Ok(marked) => info!(marked, "no-show sweep"),
            Err(e) => error!("no-show sweep failed: {e}"),
        }
    }
}

/// Bookings dated before `today - grace_days` that are still approved become no-shows.
pub async fn sweep_no_shows(engine: &Engine, grace_days: u32) -> Result<usize, EngineError> {
    let today = engine.today();
    let cutoff = today
        .checked_sub_days(Days::new(u64::from(grace_days)))
        .unwrap_or(NaiveDate::MIN);
    engine.mark_no_shows(cutoff).await
}

/// Background task that queues next-day reminders once per calendar day.
pub async fn run_reminders(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    let mut last_sent: Option<NaiveDate> = None;
    loop {
        interval.tick().await;
        let Some(tomorrow) = engine.today().succ_opt() else {
            continue;
        };
        if last_sent == Some(tomorrow) {
            continue;
        }
        let queued = send_reminders(&engine, tomorrow).await;
        info!(date = %tomorrow, queued, "reminders queued");
        last_sent = Some(tomorrow);
    }
}

/// Queue a reminder for every approved booking on `date`. Returns how many were queued.
pub async fn send_reminders(engine: &Engine, date: NaiveDate) -> usize {
    let mut queued = 0;
    for notice in engine.due_reminders(date).await {
        if engine.outbox().enqueue(notice) {
            queued += 1;
        }
    }
    queued
}
