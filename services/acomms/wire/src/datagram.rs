//! CBOR encoding of whole transmissions.
//!
//! Datagram transports carry exactly one encoded transmission per packet;
//! stream transports carry one per byte-stuffed message.

use crate::error::WireError;
use crate::transmission::Transmission;
use bytes::Bytes;

/// Largest UDP payload (65535 - 8 byte UDP header - 20 byte IP header)
pub const UDP_MAX_PACKET_SIZE: usize = 65507;

/// Encode a transmission as CBOR
pub fn encode_transmission(transmission: &Transmission) -> Result<Bytes, WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(transmission, &mut buf).map_err(|e| WireError::Cbor(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a CBOR transmission
pub fn decode_transmission(bytes: &[u8]) -> Result<Transmission, WireError> {
    ciborium::from_reader(bytes).map_err(|e| WireError::Cbor(e.to_string()))
}

/// Encode a transmission as a single datagram
pub fn encode_datagram(transmission: &Transmission) -> Result<Bytes, WireError> {
    let bytes = encode_transmission(transmission)?;
    if bytes.len() > UDP_MAX_PACKET_SIZE {
        return Err(WireError::Size(bytes.len()));
    }
    Ok(bytes)
}
