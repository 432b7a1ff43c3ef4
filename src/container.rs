//! Container lifecycle: the thing that turns a set of registered queues
//! into running schedulers, reapers and pollers, and tears them back down
//! again. `INITIAL -> STARTING -> RUNNING -> STOPPING -> STOPPED`, guarded
//! by a small mutex rather than an atomic - transitions are rare and
//! never on a hot path.

use crate::config::{BrokerConfig, BrokerConfigBuilder, MappingInfo};
use crate::error::Error;
use crate::executor::Executor;
use crate::keys::QueueKeys;
use crate::message::MessageTemplate;
use crate::reaper;
use crate::registry::{Handler, HandlerRegistry};
use crate::retry::{StateMachine, TerminalHook};
use crate::poller;
use crate::scheduler;
use crate::signal::StopHandle;
use log::warn;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Where a [`Container`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerState {
    Initial,
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct RunningHandles {
    stop_handle: StopHandle,
    tasks: Vec<JoinHandle<()>>,
}

/// Registers handlers and policy for every queue the container will run,
/// then freezes everything at [`build`](Self::build).
pub struct ContainerBuilder<T> {
    conn: ConnectionManager,
    registry: HandlerRegistry<T>,
    config: BrokerConfigBuilder<T>,
    discard_processor: Option<Arc<dyn TerminalHook<T>>>,
    dead_letter_processor: Option<Arc<dyn TerminalHook<T>>>,
}

impl<T> ContainerBuilder<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn new(conn: ConnectionManager) -> Self {
        ContainerBuilder {
            conn,
            registry: HandlerRegistry::new(),
            config: BrokerConfigBuilder::default(),
            discard_processor: None,
            dead_letter_processor: None,
        }
    }

    /// Register a handler for `mapping.name()`. Rejects an invalid
    /// mapping immediately rather than deferring the failure to `start`.
    pub fn register(
        mut self,
        mapping: MappingInfo,
        handler: impl Handler<T> + 'static,
    ) -> Result<Self, Error> {
        self.registry.register(mapping, handler)?;
        Ok(self)
    }

    /// Adjust the broker-wide configuration. Validated once at `build`.
    pub fn configure(
        mut self,
        f: impl FnOnce(BrokerConfigBuilder<T>) -> BrokerConfigBuilder<T>,
    ) -> Self {
        self.config = f(self.config);
        self
    }

    /// Best-effort hook invoked when a message is discarded with no DLQ
    /// configured.
    pub fn with_discard_processor(mut self, hook: impl TerminalHook<T> + 'static) -> Self {
        self.discard_processor = Some(Arc::new(hook));
        self
    }

    /// Best-effort hook invoked when a message is moved to its DLQ.
    pub fn with_dead_letter_processor(mut self, hook: impl TerminalHook<T> + 'static) -> Self {
        self.dead_letter_processor = Some(Arc::new(hook));
        self
    }

    /// Validate the configuration and freeze the set of registered queues.
    /// Fails if no queue has been registered, or if the configured codec
    /// chain is empty.
    pub fn build(self) -> Result<Container<T>, Error> {
        if self.registry.is_empty() {
            return Err(Error::configuration(
                "container requires at least one registered queue",
            ));
        }
        let config = self.config.build()?;
        Ok(Container {
            conn: self.conn,
            registry: Arc::new(self.registry),
            config,
            discard_processor: self.discard_processor,
            dead_letter_processor: self.dead_letter_processor,
            state: Mutex::new(ContainerState::Initial),
            running: Mutex::new(None),
        })
    }
}

/// Owns one scheduler, one reaper and one poller per registered queue,
/// and the shared worker pool they dispatch into.
pub struct Container<T> {
    conn: ConnectionManager,
    registry: Arc<HandlerRegistry<T>>,
    config: BrokerConfig<T>,
    discard_processor: Option<Arc<dyn TerminalHook<T>>>,
    dead_letter_processor: Option<Arc<dyn TerminalHook<T>>>,
    state: Mutex<ContainerState>,
    running: Mutex<Option<RunningHandles>>,
}

impl<T> Container<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn builder(conn: ConnectionManager) -> ContainerBuilder<T> {
        ContainerBuilder::new(conn)
    }

    pub fn state(&self) -> ContainerState {
        *self.state.lock().expect("container state mutex poisoned")
    }

    /// Whether this container should be started as soon as it is built,
    /// per its [`BrokerConfig`]. The crate never acts on this by itself -
    /// `build` and `start` stay separate so a config record never has a
    /// side effect - but an embedding application can check it to decide
    /// whether to call `start` immediately.
    pub fn auto_startup(&self) -> bool {
        self.config.auto_startup
    }

    /// Spawn one reaper, one scheduler, and one poller per registered
    /// queue, then move to `RUNNING`. Returns
    /// [`Error::Configuration`] if the container is not in `INITIAL` or
    /// `STOPPED`.
    pub async fn start(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock().expect("container state mutex poisoned");
            match *state {
                ContainerState::Initial | ContainerState::Stopped => {
                    *state = ContainerState::Starting;
                }
                other => {
                    return Err(Error::configuration(format!(
                        "cannot start a container in state {other:?}"
                    )))
                }
            }
        }

        let (stop_handle, stop_signal) = StopHandle::new();
        let max_workers = self
            .config
            .max_num_workers
            .unwrap_or_else(|| self.registry.len().max(1));
        let executor = Executor::new(max_workers);
        let mut tasks = Vec::new();

        let queue_names: Vec<String> = self.registry.queue_names().map(str::to_string).collect();
        for queue in queue_names {
            let mapping = self
                .registry
                .mapping(&queue)
                .expect("queue name came from this registry")
                .clone();
            let handler = self
                .registry
                .handler(&queue)
                .expect("queue name came from this registry");
            let keys = QueueKeys::new(queue.clone());
            let template = MessageTemplate::new(self.conn.clone(), self.config.codec.clone());
            let raw_store = template.raw_store().clone();

            let mut state_machine = StateMachine::new(template.clone(), self.config.back_off_time);
            if let Some(hook) = &self.discard_processor {
                state_machine = state_machine.with_discard_processor(hook.clone());
            }
            if let Some(hook) = &self.dead_letter_processor {
                state_machine = state_machine.with_dead_letter_processor(hook.clone());
            }
            let state_machine = Arc::new(state_machine);

            tasks.push(tokio::spawn(reaper::run(
                raw_store.clone(),
                keys.clone(),
                self.config.back_off_time,
                stop_signal.clone(),
            )));

            // Spawned for every queue, not only ones registered as
            // delayed: a retried message is re-enqueued with backoff via
            // the delayed set regardless of `mapping.is_delayed()`, so a
            // non-delayed queue still needs its delayed set promoted or
            // retries would be stranded there forever.
            tasks.push(tokio::spawn(scheduler::run(
                raw_store.clone(),
                keys.clone(),
                self.config.back_off_time,
                stop_signal.clone(),
            )));

            tasks.push(tokio::spawn(poller::run(
                template,
                keys,
                mapping,
                handler,
                state_machine,
                executor.clone(),
                self.config.poll_interval,
                self.config.back_off_time,
                stop_signal.clone(),
            )));
        }

        *self.running.lock().expect("container running mutex poisoned") = Some(RunningHandles {
            stop_handle,
            tasks,
        });
        *self.state.lock().expect("container state mutex poisoned") = ContainerState::Running;
        Ok(())
    }

    /// Signal every loop to quiesce, then wait up to
    /// [`shutdown_grace`](crate::config::BrokerConfigBuilder::shutdown_grace)
    /// for them to drain before abandoning whatever is still outstanding.
    /// Idempotent: calling `stop` on an already-stopped container is a
    /// no-op.
    pub async fn stop(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock().expect("container state mutex poisoned");
            match *state {
                ContainerState::Running => *state = ContainerState::Stopping,
                ContainerState::Stopped => return Ok(()),
                other => {
                    return Err(Error::configuration(format!(
                        "cannot stop a container in state {other:?}"
                    )))
                }
            }
        }

        let handles = self
            .running
            .lock()
            .expect("container running mutex poisoned")
            .take();
        if let Some(RunningHandles { stop_handle, tasks }) = handles {
            stop_handle.stop();
            let grace = self.config.shutdown_grace;
            if tokio::time::timeout(grace, futures::future::join_all(tasks))
                .await
                .is_err()
            {
                warn!(
                    "container shutdown exceeded its grace period of {grace:?}; abandoning outstanding work"
                );
            }
        }

        *self.state.lock().expect("container state mutex poisoned") = ContainerState::Stopped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{connect, Message};
    use std::time::Duration;

    async fn conn() -> ConnectionManager {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1".to_string());
        connect(redis_url).await.expect("connect to redis")
    }

    #[tokio::test]
    #[ignore = "requires a running redis instance"]
    async fn build_rejects_a_container_with_no_registered_queues() {
        let builder: ContainerBuilder<String> = Container::builder(conn().await);
        assert!(builder.build().is_err());
    }

    #[tokio::test]
    #[ignore = "requires a running redis instance"]
    async fn start_then_stop_round_trips_through_the_lifecycle() {
        let container: Container<String> = Container::builder(conn().await)
            .register(
                MappingInfo::new("container_lifecycle_q").max_job_execution_time_ms(900_000),
                |_msg: Message<String>| async move { Ok(()) },
            )
            .expect("register")
            .build()
            .expect("build");

        assert_eq!(container.state(), ContainerState::Initial);
        container.start().await.expect("start");
        assert_eq!(container.state(), ContainerState::Running);
        container.stop().await.expect("stop");
        assert_eq!(container.state(), ContainerState::Stopped);

        // Idempotent: stopping an already-stopped container is a no-op.
        container.stop().await.expect("stop again");
    }

    #[tokio::test]
    #[ignore = "requires a running redis instance"]
    async fn stop_honors_its_grace_period_when_work_never_finishes() {
        let container: Container<String> = Container::builder(conn().await)
            .register(
                MappingInfo::new("container_grace_q").max_job_execution_time_ms(900_000),
                |_msg: Message<String>| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
            )
            .expect("register")
            .configure(|c| c.shutdown_grace(Duration::from_millis(50)))
            .build()
            .expect("build");

        container.start().await.expect("start");
        let started = std::time::Instant::now();
        container.stop().await.expect("stop");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(container.state(), ContainerState::Stopped);
    }
}
