//! Redis key layout.
//!
//! This is part of the external compatibility surface (ß3 of the design):
//! the key names below must stay bit-stable so an existing deployment's
//! Redis data remains readable across upgrades. Only [`MessageTemplate`]
//! and [`RawStore`](crate::message::RawStore) are allowed to know about
//! them; every other component goes through those two.

/// Redis keys derived from a queue name.
///
/// | Role | Structure | Key |
/// |---|---|---|
/// | Ready list | list | `<queue>` |
/// | Delayed set | zset, score = `processAt` | `<queue>:delayed` |
/// | Processing set | zset, score = visibility deadline | `<queue>:processing` |
/// | Queue config | hash | `<queue>:config` |
#[derive(Clone, Debug)]
pub struct QueueKeys {
    queue: String,
}

impl QueueKeys {
    pub fn new(queue: impl Into<String>) -> Self {
        QueueKeys {
            queue: queue.into(),
        }
    }

    /// The queue name this key set was derived from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Ready list: a Redis list of message ids available for dispatch.
    pub fn ready_list(&self) -> String {
        self.queue.clone()
    }

    /// Delayed set: a Redis sorted set of message ids scored by
    /// scheduled-at milliseconds.
    pub fn delayed_set(&self) -> String {
        format!("{}:delayed", self.queue)
    }

    /// Processing set: a Redis sorted set of in-flight message ids scored
    /// by visibility deadline milliseconds.
    pub fn processing_set(&self) -> String {
        format!("{}:processing", self.queue)
    }

    /// Queue config hash, persisted until the queue is explicitly deleted.
    pub fn config_hash(&self) -> String {
        format!("{}:config", self.queue)
    }
}

/// The per-message metadata hash key: `<messageId>:meta`.
pub fn meta_key(message_id: &str) -> String {
    format!("{message_id}:meta")
}
