//! Pluggable bytes <-> value conversion.
//!
//! The broker never hard-codes a wire format. A [`Codec`] converts a typed
//! value to and from bytes; a [`CodecChain`] tries an ordered list of them
//! and uses the first one that can handle the payload, mirroring how the
//! producer/consumer side of the broker is meant to be agnostic of the
//! serialization framework in use.

use crate::error::Error;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Converts between a typed value and its wire representation.
pub trait Codec<T>: Send + Sync {
    /// Encode a value to bytes.
    fn encode(&self, value: &T) -> Result<Vec<u8>, Error>;

    /// Decode bytes back into a value.
    fn decode(&self, bytes: &[u8]) -> Result<T, Error>;
}

/// The default codec: JSON via serde.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(value).map_err(Error::codec)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, Error> {
        serde_json::from_slice(bytes).map_err(Error::codec)
    }
}

/// An ordered chain of codecs. Encoding always uses the first codec;
/// decoding tries each in turn and returns the first successful decode.
///
/// This is what lets a broker built against one wire format read messages
/// written by a previous generation that used a different one, without the
/// core ever needing to know what either format is.
pub struct CodecChain<T> {
    codecs: Vec<Arc<dyn Codec<T>>>,
}

impl<T> Clone for CodecChain<T> {
    fn clone(&self) -> Self {
        CodecChain {
            codecs: self.codecs.clone(),
        }
    }
}

impl<T> CodecChain<T> {
    /// Build a chain from an ordered, non-empty list of codecs.
    ///
    /// Returns a configuration error if the list is empty; an empty
    /// converter chain can never encode a message for enqueueing.
    pub fn new(codecs: Vec<Arc<dyn Codec<T>>>) -> Result<Self, Error> {
        if codecs.is_empty() {
            return Err(Error::configuration("messageConverters must be non-empty"));
        }
        Ok(CodecChain { codecs })
    }

    pub fn encode(&self, value: &T) -> Result<Vec<u8>, Error> {
        self.codecs[0].encode(value)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<T, Error> {
        let mut last_err = None;
        for codec in &self.codecs {
            match codec.decode(bytes) {
                Ok(value) => return Ok(value),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::codec("no codec configured")))
    }
}

impl<T> Default for CodecChain<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn default() -> Self {
        CodecChain {
            codecs: vec![Arc::new(JsonCodec)],
        }
    }
}
