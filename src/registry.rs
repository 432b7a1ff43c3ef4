//! The handler registry: a frozen map from queue name to a user callback
//! plus its [`MappingInfo`].

use crate::config::MappingInfo;
use crate::error::Error;
use crate::message::Message;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// A user callback invoked with a decoded message. `Ok(())` acknowledges
/// the message; `Err` drives the retry/DLQ state machine. Takes the
/// message by value - callers that need it afterward (for a dead-letter
/// or discard hook) clone before calling in.
pub trait Handler<T>: Send + Sync {
    fn call(&self, message: Message<T>) -> BoxFuture<'static, Result<(), Error>>;
}

impl<T, F, Fut> Handler<T> for F
where
    F: Fn(Message<T>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), Error>> + Send + 'static,
{
    fn call(&self, message: Message<T>) -> BoxFuture<'static, Result<(), Error>> {
        Box::pin((self)(message))
    }
}

struct Registration<T> {
    mapping: MappingInfo,
    handler: Arc<dyn Handler<T>>,
}

/// Maps a queue name to its handler and policy. Immutable once the
/// container has started: registrations only ever happen before
/// `Container::build`.
pub struct HandlerRegistry<T> {
    entries: HashMap<String, Registration<T>>,
}

impl<T> Default for HandlerRegistry<T> {
    fn default() -> Self {
        HandlerRegistry {
            entries: HashMap::new(),
        }
    }
}

impl<T> HandlerRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `mapping.name()`. Rejects an invalid
    /// mapping outright rather than deferring the failure to startup.
    pub fn register(
        &mut self,
        mapping: MappingInfo,
        handler: impl Handler<T> + 'static,
    ) -> Result<(), Error> {
        mapping.validate()?;
        self.entries.insert(
            mapping.name().to_string(),
            Registration {
                mapping,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    pub fn mapping(&self, queue: &str) -> Option<&MappingInfo> {
        self.entries.get(queue).map(|r| &r.mapping)
    }

    pub fn handler(&self, queue: &str) -> Option<Arc<dyn Handler<T>>> {
        self.entries.get(queue).map(|r| r.handler.clone())
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
