//! The retry / dead-letter state machine (ß4.7).
//!
//! The only thing this module decides is *what to do* with a message
//! after a handler has run; [`MessageTemplate`] carries the decision out.
//! It is also the only application-side writer of `retry_count` - the
//! reaper is the only other writer, and it acts from the infrastructure
//! side when a message's visibility deadline lapses rather than when a
//! handler actually failed.

use crate::config::MappingInfo;
use crate::error::Error;
use crate::keys::QueueKeys;
use crate::message::{Message, MessageId, MessageTemplate};
use futures::future::BoxFuture;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// What happened to a message after its handler ran.
#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    /// The handler succeeded.
    Ack,
    /// The handler failed but retries remain; reschedule with backoff.
    Retry,
    /// Retries are exhausted and a dead letter queue is configured.
    DeadLetter,
    /// Retries are exhausted and no dead letter queue is configured.
    Discard,
}

/// Decide the outcome for a message that just ran through a handler.
/// `retry_count` is the count *before* this attempt.
pub fn decide(mapping: &MappingInfo, retry_count: u32, handler_failed: bool) -> Decision {
    if !handler_failed {
        return Decision::Ack;
    }
    if retry_count < mapping.num_retries_allowed() {
        return Decision::Retry;
    }
    if mapping.dead_letter_queue().is_some() {
        Decision::DeadLetter
    } else {
        Decision::Discard
    }
}

/// A fire-and-log notifier invoked at a terminal transition. Errors are
/// logged, never propagated - ß4.7 calls these "best-effort".
pub trait TerminalHook<T>: Send + Sync {
    fn call(&self, message: &Message<T>) -> BoxFuture<'static, ()>;
}

impl<T, F, Fut> TerminalHook<T> for F
where
    F: Fn(&Message<T>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    fn call(&self, message: &Message<T>) -> BoxFuture<'static, ()> {
        Box::pin((self)(message))
    }
}

/// The default no-op hook.
pub struct NoopHook;

impl<T: Send + Sync> TerminalHook<T> for NoopHook {
    fn call(&self, _message: &Message<T>) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// Carries out [`Decision`]s against the message template and invokes the
/// configured discard / dead-letter hooks.
pub struct StateMachine<T> {
    template: MessageTemplate<T>,
    back_off_time: Duration,
    discard_processor: Arc<dyn TerminalHook<T>>,
    dead_letter_processor: Arc<dyn TerminalHook<T>>,
}

impl<T> StateMachine<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(template: MessageTemplate<T>, back_off_time: Duration) -> Self {
        StateMachine {
            template,
            back_off_time,
            discard_processor: Arc::new(NoopHook),
            dead_letter_processor: Arc::new(NoopHook),
        }
    }

    pub fn with_discard_processor(mut self, hook: Arc<dyn TerminalHook<T>>) -> Self {
        self.discard_processor = hook;
        self
    }

    pub fn with_dead_letter_processor(mut self, hook: Arc<dyn TerminalHook<T>>) -> Self {
        self.dead_letter_processor = hook;
        self
    }

    /// Apply the outcome of running `message` through its handler.
    pub async fn settle(
        &self,
        keys: &QueueKeys,
        mapping: &MappingInfo,
        message: Message<T>,
        handler_failed: bool,
    ) -> Result<(), Error> {
        let decision = decide(mapping, message.retry_count, handler_failed);
        match decision {
            Decision::Ack => {
                self.template.ack_processing(keys, &message.id).await?;
            }
            Decision::Retry => {
                self.template
                    .re_enqueue(keys, &message.id, self.back_off_time)
                    .await?;
            }
            Decision::DeadLetter => {
                let dlq = mapping
                    .dead_letter_queue()
                    .expect("DeadLetter decision implies a configured DLQ")
                    .to_string();
                self.template.move_to_dlq(keys, &dlq, &message.id).await?;
                warn!(
                    "message {} on queue '{}' exhausted retries, moved to '{dlq}'",
                    message.id, keys.queue()
                );
                self.dead_letter_processor.call(&message).await;
            }
            Decision::Discard => {
                self.template.ack_processing(keys, &message.id).await?;
                warn!(
                    "message {} on queue '{}' exhausted retries, discarded",
                    message.id,
                    keys.queue()
                );
                self.discard_processor.call(&message).await;
            }
        }
        Ok(())
    }

    /// Settle a message whose payload no configured codec could decode.
    /// There is no decoded [`Message<T>`] to hand a handler or a terminal
    /// hook, so this always goes straight to the dead letter queue or is
    /// discarded - retrying would just hit the same decode failure again.
    pub async fn settle_undecodable(
        &self,
        keys: &QueueKeys,
        mapping: &MappingInfo,
        id: MessageId,
        _retry_count: u32,
    ) -> Result<(), Error> {
        match mapping.dead_letter_queue() {
            Some(dlq) => {
                self.template.move_to_dlq(keys, dlq, &id).await?;
                warn!(
                    "message {id} on queue '{}' had an undecodable payload, moved to '{dlq}'",
                    keys.queue()
                );
            }
            None => {
                self.template.ack_processing(keys, &id).await?;
                warn!(
                    "message {id} on queue '{}' had an undecodable payload, discarded",
                    keys.queue()
                );
            }
        }
        Ok(())
    }
}
