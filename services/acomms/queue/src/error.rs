//! Queue and codec error types.

use thiserror::Error;

/// Errors raised by a message codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The message could not be encoded
    #[error("encode failed: {0}")]
    Encode(String),

    /// The bytes could not be decoded
    #[error("decode failed: {0}")]
    Decode(String),

    /// A packed frame ended inside a message
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the length prefix promised
        needed: usize,
        /// Bytes left in the frame
        available: usize,
    },
}

/// Queue manager errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    /// Invalid policy, unknown message type or unusable role field
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Codec failure while encoding or decoding a message
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The queue manager behind a push handle is gone
    #[error("queue manager closed")]
    Closed,
}
