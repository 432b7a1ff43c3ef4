//! Processing-set reaper: recovers messages whose visibility deadline has
//! passed, returning them to the ready list and counting the reap as a
//! retry attempt.

use crate::keys::QueueKeys;
use crate::message::RawStore;
use crate::signal::StopSignal;
use chrono::Utc;
use log::error;
use std::time::Duration;

const SLEEP_FLOOR: Duration = Duration::from_millis(5);
const SLEEP_CEILING: Duration = Duration::from_millis(100);
const BATCH_LIMIT: usize = 100;

/// Runs the reap loop for one queue until `stop` fires. One logical
/// reaper per registered queue, delayed or not - every queue has a
/// processing set and therefore something to recover.
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
        match store.reap_processing(&keys, now, BATCH_LIMIT).await {
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
                    "reaper for queue '{}' failed to reclaim expired messages: {e}",
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
