//! redqueue is a Redis-backed task queue.
//!
//! Application code enqueues work items ("messages") against named queues
//! and worker pools consume, execute, and acknowledge them. The broker
//! supports delayed (scheduled) delivery, in-flight visibility timeouts,
//! bounded retries with backoff, and dead-letter routing.
//!
//! The moving parts, in dependency order:
//!
//! - [`message`] - atomic Redis operations over lists and sorted sets.
//! - [`scheduler`] - promotes due delayed messages into the ready list.
//! - [`reaper`] - recovers messages whose visibility timeout expired.
//! - [`poller`] - moves ready messages into the processing set and hands
//!   them to the worker pool.
//! - [`executor`] - a bounded concurrent pool that runs handlers.
//! - [`registry`] - maps queue names to handlers and their policy.
//! - [`retry`] - the ack / retry / dead-letter state machine.
//! - [`container`] - owns the lifecycle of everything above.
//!
//! ```rust,no_run
//! use redqueue::prelude::*;
//!
//! #[derive(serde::Serialize, serde::Deserialize, Clone)]
//! struct Email {
//!     to: String,
//!     body: String,
//! }
//!
//! # async fn run() -> Result<(), Error> {
//! let conn = redqueue::connect("redis://127.0.0.1").await?;
//!
//! let container = Container::builder(conn)
//!     .register(
//!         MappingInfo::new("emails")
//!             .num_retries(3)
//!             .dead_letter_queue("emails_dlq")
//!             .max_job_execution_time_ms(30_000),
//!         |msg: Message<Email>| async move {
//!             println!("sending to {}", msg.payload.to);
//!             Ok(())
//!         },
//!     )?
//!     .build()?;
//!
//! container.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod container;
pub mod error;
pub mod executor;
pub mod keys;
pub mod message;
pub mod poller;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod signal;

pub use message::connect;

/// Commonly used types, re-exported for convenience.
pub mod prelude {
    pub use crate::codec::{Codec, JsonCodec};
    pub use crate::config::{BrokerConfig, MappingInfo};
    pub use crate::container::Container;
    pub use crate::error::Error;
    pub use crate::message::{Message, MessageId, MessageTemplate};
    pub use crate::registry::Handler;
}
