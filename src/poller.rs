//! Ready -> processing handoff, and the worker invocation that follows
//! it. Each cycle pops a ready message and, if the pool is saturated,
//! blocks on admission rather than buffering locally: the processing set
//! is the only buffer between a poller and its workers.

use crate::config::MappingInfo;
use crate::executor::Executor;
use crate::keys::QueueKeys;
use crate::message::{MessageTemplate, PopOutcome};
use crate::registry::Handler;
use crate::retry::StateMachine;
use crate::signal::StopSignal;
use log::{error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Runs the poll loop for one queue until `stop` fires.
#[allow(clippy::too_many_arguments)]
pub async fn run<T>(
    template: MessageTemplate<T>,
    keys: QueueKeys,
    mapping: MappingInfo,
    handler: Arc<dyn Handler<T>>,
    state_machine: Arc<StateMachine<T>>,
    executor: Executor,
    poll_interval: Duration,
    back_off_time: Duration,
    mut stop: StopSignal,
) where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    loop {
        if stop.is_stopped() {
            return;
        }

        match template.pop_ready(&keys, mapping.max_job_execution_time()).await {
            Ok(Some(PopOutcome::Message(message))) => {
                let handler = handler.clone();
                let state_machine = state_machine.clone();
                let keys = keys.clone();
                let mapping = mapping.clone();
                let deadline = mapping.handler_deadline();

                executor
                    .spawn(async move {
                        let outcome = tokio::time::timeout(deadline, handler.call(message.clone()))
                            .await;
                        let handler_failed = match outcome {
                            Ok(Ok(())) => false,
                            Ok(Err(e)) => {
                                warn!("handler for queue '{}' failed: {e}", keys.queue());
                                true
                            }
                            Err(_elapsed) => {
                                // Deadline exceeded: leave the message in the
                                // processing set. The reaper will rediscover
                                // it at the visibility deadline and treat
                                // the reap as a retry.
                                warn!(
                                    "handler for queue '{}' exceeded its deadline of {deadline:?}; leaving for the reaper",
                                    keys.queue()
                                );
                                return;
                            }
                        };

                        if let Err(e) = state_machine
                            .settle(&keys, &mapping, message, handler_failed)
                            .await
                        {
                            error!("failed to settle message outcome for queue '{}': {e}", keys.queue());
                        }
                    })
                    .await;
            }
            Ok(Some(PopOutcome::UndecodablePayload { id, retry_count })) => {
                warn!(
                    "message {id} on queue '{}' could not be decoded by any configured codec; routing to terminal failure",
                    keys.queue()
                );
                if let Err(e) = state_machine
                    .settle_undecodable(&keys, &mapping, id, retry_count)
                    .await
                {
                    error!("failed to settle undecodable message on queue '{}': {e}", keys.queue());
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = stop.stopped() => return,
                }
            }
            Err(e) => {
                error!("poller for queue '{}' hit a Redis error: {e}", keys.queue());
                tokio::select! {
                    _ = tokio::time::sleep(back_off_time) => {}
                    _ = stop.stopped() => return,
                }
            }
        }
    }
}
