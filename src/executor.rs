//! The worker pool: a bounded concurrent executor with `max_num_workers`
//! slots and FIFO admission. There is no local buffering between the
//! poller and the pool - the processing set *is* the buffer, so admission
//! itself blocks the caller when the pool is saturated.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// A bounded pool of concurrent task slots.
#[derive(Clone)]
pub struct Executor {
    semaphore: Arc<Semaphore>,
}

impl Executor {
    pub fn new(max_num_workers: usize) -> Self {
        Executor {
            semaphore: Arc::new(Semaphore::new(max_num_workers.max(1))),
        }
    }

    /// Block until a slot is free, then run `task` on it. Returns once
    /// the task has been admitted, not once it has completed - the
    /// caller is meant to keep polling for the next message while the
    /// task runs concurrently.
    pub async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let permit = semaphore
            .acquire_owned()
            .await
            .expect("executor semaphore should never be closed");
        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
    }

    /// Number of slots currently free.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}
