//! Error kinds produced by the broker.
//!
//! The broker distinguishes between errors that are retried transparently
//! (infrastructure), errors that terminate a single message's lifecycle
//! (codec, handler), and errors that must stop the container from ever
//! reaching `RUNNING` (configuration).

use std::fmt;

/// The broker's single error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Redis was unreachable or a script failed. Never surfaces to a
    /// handler; the caller backs off and retries.
    #[error("infrastructure error: {0}")]
    Infrastructure(#[from] redis::RedisError),

    /// A payload could not be encoded or decoded by any configured codec.
    #[error("codec error: {0}")]
    Codec(String),

    /// A handler callback returned or raised a failure.
    #[error("handler error: {0}")]
    Handler(String),

    /// A mapping or broker configuration is invalid. Fatal at registration
    /// or startup; the container refuses to enter `RUNNING`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A bad request from an external admin collaborator (move/explore).
    /// Never crashes the broker; returned to the caller as-is.
    #[error("admin request error: {0}")]
    Admin(String),
}

impl Error {
    pub(crate) fn codec(msg: impl fmt::Display) -> Self {
        Error::Codec(msg.to_string())
    }

    pub(crate) fn configuration(msg: impl fmt::Display) -> Self {
        Error::Configuration(msg.to_string())
    }

    /// True for errors that should be retried after `backOffTime` rather
    /// than surfaced as a message-level failure.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Error::Infrastructure(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
