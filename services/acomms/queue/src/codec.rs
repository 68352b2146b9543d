//! Message codec seam and frame packing.
//!
//! The queue manager treats the codec as an opaque, deterministic
//! collaborator. Several encoded messages share one payload frame; each is
//! preceded by its length as a big-endian u16.

use crate::error::CodecError;
use crate::message::DynamicMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Bytes of length prefix in front of every packed message
pub const PACKED_LENGTH_PREFIX: usize = 2;

/// Encodes and decodes structured messages
pub trait Codec: Send + Sync {
    /// Type identifier of a message
    fn type_id(&self, msg: &DynamicMessage) -> u32 {
        msg.type_id
    }

    /// Encode a message
    fn encode(&self, msg: &DynamicMessage) -> Result<Bytes, CodecError>;

    /// Decode a message
    fn decode(&self, bytes: &[u8]) -> Result<DynamicMessage, CodecError>;

    /// Encoded size of a message
    fn size(&self, msg: &DynamicMessage) -> Result<usize, CodecError> {
        Ok(self.encode(msg)?.len())
    }
}

/// Codec carrying the type id and body as canonical CBOR
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn encode(&self, msg: &DynamicMessage) -> Result<Bytes, CodecError> {
        let mut buf = Vec::new();
        ciborium::into_writer(msg, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicMessage, CodecError> {
        ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Bytes a message of `encoded_len` occupies inside a frame
pub fn packed_len(encoded_len: usize) -> usize {
    PACKED_LENGTH_PREFIX + encoded_len
}

/// Concatenate encoded messages into one frame
pub fn pack_frame(encoded: &[Bytes]) -> Result<Bytes, CodecError> {
    let mut frame = BytesMut::with_capacity(encoded.iter().map(|m| packed_len(m.len())).sum());
    for msg in encoded {
        let len = u16::try_from(msg.len())
            .map_err(|_| CodecError::Encode(format!("message of {} bytes too large to pack", msg.len())))?;
        frame.put_u16(len);
        frame.put_slice(msg);
    }
    Ok(frame.freeze())
}

/// Split a frame back into encoded messages
pub fn unpack_frame(frame: &Bytes) -> Result<Vec<Bytes>, CodecError> {
    let mut buf = frame.clone();
    let mut messages = Vec::new();

    while buf.has_remaining() {
        if buf.remaining() < PACKED_LENGTH_PREFIX {
            return Err(CodecError::Truncated {
                needed: PACKED_LENGTH_PREFIX,
                available: buf.remaining(),
            });
        }
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(CodecError::Truncated {
                needed: len,
                available: buf.remaining(),
            });
        }
        messages.push(buf.split_to(len));
    }

    Ok(messages)
}
