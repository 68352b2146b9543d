//! Transmission model and wire encodings for the acomms link layer.
//!
//! This crate holds the types every other acomms crate exchanges, plus the
//! two on-the-wire representations used by the transport drivers:
//!
//! - **Transmission**: addressing, type, rate and opaque payload frames
//! - **Clock**: wall-clock source, swappable for deterministic tests
//! - **CRC-16**: reflected 0xA001 checksum used by the stream framing
//! - **Stream framing**: magic/escape byte-stuffing with a three-phase decoder
//! - **Datagram encoding**: one CBOR transmission per packet
//!
//! ## Stream Format
//!
//! ```text
//! +-------+--------------+---------+----------+---------+-------------+
//! | 0x7E  | size u16 LE  | version | reserved | payload | crc16 u16 LE|
//! +-------+--------------+---------+----------+---------+-------------+
//!           \___________________ escaped ______________________/
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod crc;
pub mod datagram;
pub mod error;
pub mod framing;
pub mod transmission;

// Re-export main types
pub use clock::{
    duration_to_micros, seconds_to_micros, Clock, ManualClock, SystemClock, Timestamp,
    MICROS_PER_SECOND,
};
pub use crc::crc16;
pub use datagram::{decode_transmission, encode_datagram, encode_transmission, UDP_MAX_PACKET_SIZE};
pub use error::WireError;
pub use framing::{
    encode_message, ReadPhase, StreamDecoder, DEFAULT_MAX_MESSAGE_SIZE, ESCAPE, MAGIC,
};
pub use transmission::{
    next_frame_start, ModemId, Transmission, TransmissionHooks, TransmissionType,
    BROADCAST_ID, FRAME_COUNT_ROLLOVER, QUERY_DESTINATION_ID, QUERY_SOURCE_ID,
};
