//! Dispatcher fiber: translates queue claims into channel pushes for the
//! batch's workers.

use super::state::RunningBatch;
use super::BatchManager;
use crate::models::TaskStatus;
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) async fn run_dispatcher(manager: BatchManager, rb: Arc<RunningBatch>) {
    let claimant = format!("dispatcher-{}", rb.batch_id);
    debug!("Dispatcher started for batch {}", rb.batch_id);

    loop {
        tokio::select! {
            _ = rb.cancel.cancelled() => break,
            _ = tokio::time::sleep(manager.config().poll_interval) => {}
        }

        let items = match manager
            .queue()
            .claim(&rb.batch_id, &claimant, rb.concurrency)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!("Claim failed for batch {}: {}", rb.batch_id, e);
                continue;
            }
        };

        for item in items {
            let task = match manager.store().get_task(&item.task_id).await {
                Ok(task) => task,
                Err(e) => {
                    warn!("Claimed task {} missing from store: {}", item.task_id, e);
                    let _ = manager.queue().complete(&rb.batch_id, &item.task_id).await;
                    continue;
                }
            };
            // A reference can outlive its task's terminus (at-least-once
            // delivery); completion stays idempotent by dropping it here.
            if task.status != TaskStatus::Pending {
                let _ = manager.queue().complete(&rb.batch_id, &item.task_id).await;
                continue;
            }

            tokio::select! {
                _ = rb.cancel.cancelled() => return,
                sent = rb.tasks_tx.send(task) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
    debug!("Dispatcher exited for batch {}", rb.batch_id);
}
