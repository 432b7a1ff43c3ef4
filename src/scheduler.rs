//! Delayed-set promotion: one logical scheduler per registered queue,
//! moving due entries from `<queue>:delayed` into `<queue>` in score
//! order. A queue that was never registered as delayed can still
//! accumulate entries in its delayed set - a retried message is
//! re-enqueued with backoff via the delayed set regardless of the
//! queue's `delayed` flag - so every queue gets a promoter, not only
//! ones meant for producer-facing delayed delivery.

use crate::keys::QueueKeys;
use crate::message::RawStore;
use crate::signal::StopSignal;
use chrono::Utc;
use log::error;
use std::time::Duration;

/// Sleep floor and ceiling so a flood of near-due messages can't spin the
/// loop, and an empty delayed set doesn't keep it from noticing new
/// arrivals for too long.
const SLEEP_FLOOR: Duration = Duration::from_millis(5);
const SLEEP_CEILING: Duration = Duration::from_millis(100);

/// Maximum number of delayed messages promoted in a single script call.
const BATCH_LIMIT: usize = 100;

/// Runs the promotion loop for one queue until `stop` fires. Spawned for
/// every registered queue, delayed or not.
pub async fn run(
    store: RawStore,
    keys: QueueKeys,
    back_off_time: Duration,
    mut stop: StopSignal,
) {
    loop {
        if stop.is_stopped() {
            return;
        }

        let now = Utc::now().timestamp_millis();
        match store.promote_delayed(&keys, now, BATCH_LIMIT).await {
            Ok(outcome) => {
                let sleep_for = match outcome.next_due_ms {
                    Some(next) => {
                        let wait = (next - now).max(0) as u64;
                        Duration::from_millis(wait).clamp(SLEEP_FLOOR, SLEEP_CEILING)
                    }
                    None => SLEEP_CEILING,
                };
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = stop.stopped() => return,
                }
            }
            Err(e) => {
                error!(
                    "scheduler for queue '{}' failed to promote delayed messages: {e}",
                    keys.queue()
                );
                tokio::select! {
                    _ = tokio::time::sleep(back_off_time) => {}
                    _ = stop.stopped() => return,
                }
            }
        }
    }
}
