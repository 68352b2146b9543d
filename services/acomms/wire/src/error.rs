//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Declared or encoded size outside the allowed range
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// CRC-16 of the received message does not match the transmitted value
    #[error("crc mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    Crc {
        /// CRC carried on the wire
        expected: u16,
        /// CRC computed over the received bytes
        computed: u16,
    },

    /// Unsupported framing version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Unknown transmission type
    #[error("unknown type {0}")]
    Type(u8),

    /// Escape byte followed by something other than an escape code
    #[error("invalid escape sequence")]
    Escape,

    /// CBOR serialization failed
    #[error("cbor: {0}")]
    Cbor(String),

    /// Malformed message structure
    #[error("malformed message")]
    Malformed,
}
