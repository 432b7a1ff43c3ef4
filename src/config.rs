//! Queue policy and broker-wide configuration.

use crate::codec::{CodecChain, JsonCodec};
use crate::error::Error;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// The shortest amount of time a handler is ever given to run.
pub const MIN_EXECUTION_TIME: Duration = Duration::from_millis(100);

/// Slack reserved between a message's visibility timeout and the deadline
/// handed to the user handler, so the retry/DLQ state machine always has
/// time to act before the reaper would otherwise rediscover the message.
pub const DELTA_BETWEEN_RE_ENQUEUE_TIME: Duration = Duration::from_millis(50);

/// Immutable per-queue policy: retries, delayed delivery, DLQ routing and
/// the visibility timeout. Built once at registration time and never
/// mutated afterwards.
#[derive(Clone, Debug)]
pub struct MappingInfo {
    name: String,
    delayed: bool,
    num_retries: u32,
    dead_letter_queues: Vec<String>,
    max_job_execution_time: Duration,
}

impl MappingInfo {
    /// Start building a mapping for `queue`. Defaults: not delayed, zero
    /// retries, no DLQ, 15 minute visibility timeout (matches the broker
    /// default `maxJobExecutionTime`).
    pub fn new(queue: impl Into<String>) -> Self {
        MappingInfo {
            name: queue.into(),
            delayed: false,
            num_retries: 0,
            dead_letter_queues: Vec::new(),
            max_job_execution_time: Duration::from_secs(900),
        }
    }

    pub fn delayed(mut self, delayed: bool) -> Self {
        self.delayed = delayed;
        self
    }

    pub fn num_retries(mut self, num_retries: u32) -> Self {
        self.num_retries = num_retries;
        self
    }

    pub fn dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_queues.push(name.into());
        self
    }

    pub fn max_job_execution_time_ms(mut self, ms: u64) -> Self {
        self.max_job_execution_time = Duration::from_millis(ms);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_delayed(&self) -> bool {
        self.delayed
    }

    pub fn num_retries_allowed(&self) -> u32 {
        self.num_retries
    }

    /// The queue's primary dead letter queue, if configured. A mapping may
    /// list more than one DLQ name for the admin `exploreQueue` surface,
    /// but only the first is used as the live routing target.
    pub fn dead_letter_queue(&self) -> Option<&str> {
        self.dead_letter_queues.first().map(String::as_str)
    }

    pub fn dead_letter_queues(&self) -> &[String] {
        &self.dead_letter_queues
    }

    pub fn max_job_execution_time(&self) -> Duration {
        self.max_job_execution_time
    }

    /// The deadline handed to the user handler: the visibility timeout
    /// minus [`DELTA_BETWEEN_RE_ENQUEUE_TIME`].
    pub fn handler_deadline(&self) -> Duration {
        self.max_job_execution_time
            .saturating_sub(DELTA_BETWEEN_RE_ENQUEUE_TIME)
    }

    /// A mapping is valid when its queue name is non-empty and its
    /// visibility timeout leaves enough room for the state machine's
    /// own bookkeeping.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
            && self.max_job_execution_time >= MIN_EXECUTION_TIME + DELTA_BETWEEN_RE_ENQUEUE_TIME
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::configuration("mapping queue name must not be empty"));
        }
        if self.max_job_execution_time < MIN_EXECUTION_TIME + DELTA_BETWEEN_RE_ENQUEUE_TIME {
            return Err(Error::configuration(format!(
                "maxJobExecutionTime for queue '{}' must be at least {:?}",
                self.name,
                MIN_EXECUTION_TIME + DELTA_BETWEEN_RE_ENQUEUE_TIME
            )));
        }
        Ok(())
    }
}

/// Broker-wide configuration. Built with [`BrokerConfigBuilder`], which
/// validates once at `build()` rather than letting callers mutate a live
/// config after the container has started.
#[derive(Clone)]
pub struct BrokerConfig<T> {
    pub(crate) auto_startup: bool,
    pub(crate) max_num_workers: Option<usize>,
    pub(crate) back_off_time: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) scheduler_floor: Duration,
    pub(crate) scheduler_ceiling: Duration,
    pub(crate) shutdown_grace: Duration,
    pub(crate) codec: CodecChain<T>,
}

impl<T> BrokerConfig<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    pub fn builder() -> BrokerConfigBuilder<T> {
        BrokerConfigBuilder::default()
    }
}

/// Mutable setter builder for [`BrokerConfig`]. Validation happens once,
/// in [`build`](Self::build); the resulting config is immutable.
pub struct BrokerConfigBuilder<T> {
    auto_startup: bool,
    max_num_workers: Option<usize>,
    back_off_time: Duration,
    poll_interval: Duration,
    scheduler_floor: Duration,
    scheduler_ceiling: Duration,
    shutdown_grace: Duration,
    codecs: Vec<Arc<dyn crate::codec::Codec<T>>>,
}

impl<T> Default for BrokerConfigBuilder<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn default() -> Self {
        BrokerConfigBuilder {
            auto_startup: true,
            max_num_workers: None,
            back_off_time: Duration::from_millis(10_000),
            poll_interval: Duration::from_millis(500),
            scheduler_floor: Duration::from_millis(5),
            scheduler_ceiling: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(10),
            codecs: vec![Arc::new(JsonCodec)],
        }
    }
}

impl<T> BrokerConfigBuilder<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    /// Start the container automatically when it is built. Default `true`.
    pub fn auto_startup(mut self, auto_startup: bool) -> Self {
        self.auto_startup = auto_startup;
        self
    }

    /// Worker-pool size. Defaults to the number of registered queues.
    pub fn max_num_workers(mut self, max_num_workers: usize) -> Self {
        self.max_num_workers = Some(max_num_workers);
        self
    }

    /// Sleep duration after a Redis error before a loop retries. Default
    /// 10s, matching the spec's `backOffTime`.
    pub fn back_off_time(mut self, back_off_time: Duration) -> Self {
        self.back_off_time = back_off_time;
        self
    }

    /// Poller sleep when a queue's ready list is empty. Default 500ms.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Replace the ordered codec chain used to encode and decode
    /// payloads. Must be non-empty; enforced at `build()`.
    pub fn message_converters(mut self, codecs: Vec<Arc<dyn crate::codec::Codec<T>>>) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<BrokerConfig<T>, Error> {
        let codec = CodecChain::new(self.codecs)?;
        Ok(BrokerConfig {
            auto_startup: self.auto_startup,
            max_num_workers: self.max_num_workers,
            back_off_time: self.back_off_time,
            poll_interval: self.poll_interval,
            scheduler_floor: self.scheduler_floor,
            scheduler_ceiling: self.scheduler_ceiling,
            shutdown_grace: self.shutdown_grace,
            codec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_requires_enough_headroom() {
        let ok = MappingInfo::new("q").max_job_execution_time_ms(
            (MIN_EXECUTION_TIME + DELTA_BETWEEN_RE_ENQUEUE_TIME).as_millis() as u64,
        );
        assert!(ok.is_valid());

        let too_small = MappingInfo::new("q").max_job_execution_time_ms(
            (MIN_EXECUTION_TIME + DELTA_BETWEEN_RE_ENQUEUE_TIME).as_millis() as u64 - 1,
        );
        assert!(!too_small.is_valid());
    }

    #[test]
    fn mapping_requires_a_name() {
        let m = MappingInfo::new("").max_job_execution_time_ms(900_000);
        assert!(!m.is_valid());
    }

    #[test]
    fn empty_converter_chain_is_rejected() {
        let built = BrokerConfigBuilder::<String>::default()
            .message_converters(vec![])
            .build();
        assert!(built.is_err());
    }
}
