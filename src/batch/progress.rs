//! Progress reporter fiber: periodic `batch.progress` events with
//! throughput and ETA derived from the completion-time ring buffer.

use super::state::{BatchCounters, RunningBatch};
use super::BatchManager;
use crate::events::{BatchEvent, EventKind, ProgressPayload};
use std::sync::Arc;
use tracing::debug;

pub(crate) async fn run_reporter(manager: BatchManager, rb: Arc<RunningBatch>) {
    debug!("Progress reporter started for batch {}", rb.batch_id);
    loop {
        tokio::select! {
            _ = rb.cancel.cancelled() => break,
            _ = tokio::time::sleep(manager.config().progress_interval) => {}
        }
        let payload = {
            let counters = rb.counters.lock().await;
            snapshot(&counters, rb.total)
        };
        manager
            .events()
            .publish(BatchEvent::new(
                &rb.batch_id,
                EventKind::BatchProgress,
                &payload,
            ))
            .await;
    }
    debug!("Progress reporter exited for batch {}", rb.batch_id);
}

fn snapshot(counters: &BatchCounters, total: u64) -> ProgressPayload {
    let done = counters.done();
    let percent = if total > 0 {
        done as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    let rate = counters.rate().unwrap_or(0.0);
    let eta = if rate > 0.0 && done < total {
        format_eta(((total - done) as f64 / rate).ceil() as u64)
    } else {
        "unknown".to_string()
    };
    ProgressPayload {
        completed: counters.completed,
        failed: counters.failed,
        total,
        percent,
        eta,
        tasks_per_sec: rate,
    }
}

/// Renders a duration as `Hh Mm`, `Mm Ss`, or `Ss`.
pub(crate) fn format_eta(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
