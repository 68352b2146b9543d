//! The Transmission: one scheduled unit of link-layer communication.

use crate::clock::Timestamp;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Link-layer node address
pub type ModemId = u32;

/// Destination meaning "every node in range"
pub const BROADCAST_ID: ModemId = 0;

/// Destination placeholder filled in by the queue manager on data request
pub const QUERY_DESTINATION_ID: ModemId = ModemId::MAX;

/// Source placeholder filled in with the local id on data request
pub const QUERY_SOURCE_ID: ModemId = ModemId::MAX;

/// Frame sequence numbers wrap at this bound
pub const FRAME_COUNT_ROLLOVER: u32 = 1 << 16;

/// Advance a frame sequence number by `frames`, wrapping at the rollover bound
pub fn next_frame_start(start: u32, frames: usize) -> u32 {
    ((start as u64 + frames as u64) % FRAME_COUNT_ROLLOVER as u64) as u32
}

/// Transmission types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionType {
    /// Payload frames from the queue manager
    #[default]
    Data = 0x00,
    /// Acknowledgement of previously received frames
    Ack = 0x01,
    /// Transport specific control traffic
    DriverSpecific = 0x02,
    /// Two-way travel time ranging
    Ranging = 0x03,
}

impl TryFrom<u8> for TransmissionType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(TransmissionType::Data),
            0x01 => Ok(TransmissionType::Ack),
            0x02 => Ok(TransmissionType::DriverSpecific),
            0x03 => Ok(TransmissionType::Ranging),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

/// A transmission with its addressing, type and payload frames.
///
/// Passed by value between components; whoever holds it owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transmission {
    /// Sending node
    pub src: ModemId,
    /// Receiving node, or [`BROADCAST_ID`]
    pub dest: ModemId,
    /// Microseconds since the UNIX epoch
    pub time: Timestamp,
    /// Transmission type
    pub kind: TransmissionType,
    /// Rate / class index understood by the physical modem
    pub rate: u32,
    /// Upper bound on frames the queue manager may fill
    pub max_num_frames: u32,
    /// Upper bound on bytes per frame
    pub max_frame_bytes: u32,
    /// Sequence number of the first frame
    pub frame_start: u32,
    /// Whether the receiver should acknowledge the frames
    pub ack_requested: bool,
    /// Opaque payload frames
    pub frames: Vec<Bytes>,
    /// Acknowledged frame numbers (ACK transmissions only)
    pub acked_frames: Vec<u32>,
}

impl Default for Transmission {
    fn default() -> Self {
        Self {
            src: QUERY_SOURCE_ID,
            dest: QUERY_DESTINATION_ID,
            time: 0,
            kind: TransmissionType::Data,
            rate: 0,
            max_num_frames: 1,
            max_frame_bytes: 0,
            frame_start: 0,
            ack_requested: false,
            frames: Vec::new(),
            acked_frames: Vec::new(),
        }
    }
}

impl Transmission {
    /// Create an empty DATA transmission between two nodes
    pub fn data(src: ModemId, dest: ModemId) -> Self {
        Self {
            src,
            dest,
            ..Self::default()
        }
    }

    /// Build the ACK answering a received DATA transmission.
    ///
    /// Source and destination are swapped and every frame number carried by
    /// `received` is named, wrapping at [`FRAME_COUNT_ROLLOVER`].
    pub fn ack_for(received: &Transmission, time: Timestamp) -> Self {
        let acked_frames = (0..received.frames.len())
            .map(|i| next_frame_start(received.frame_start, i))
            .collect();

        Self {
            src: received.dest,
            dest: received.src,
            time,
            kind: TransmissionType::Ack,
            rate: received.rate,
            max_num_frames: 0,
            max_frame_bytes: 0,
            frame_start: 0,
            ack_requested: false,
            frames: Vec::new(),
            acked_frames,
        }
    }

    /// Frame number carried by the frame at `index`
    pub fn frame_number(&self, index: usize) -> u32 {
        next_frame_start(self.frame_start, index)
    }

    /// Whether the transmission carries no payload bytes
    pub fn is_empty(&self) -> bool {
        self.frames.iter().all(|f| f.is_empty())
    }

    /// Total payload bytes across all frames
    pub fn payload_len(&self) -> usize {
        self.frames.iter().map(|f| f.len()).sum()
    }
}

/// Hooks a driver invokes while preparing an outbound transmission.
///
/// The queue manager implements this so that drivers can ask for payload at
/// the instant the channel is granted.
pub trait TransmissionHooks {
    /// Adjust the transmission before payload is requested
    fn modify_transmission(&mut self, _transmission: &mut Transmission) {}

    /// Fill the transmission's frames
    fn data_request(&mut self, transmission: &mut Transmission);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmission_type_conversion() {
        assert_eq!(TransmissionType::try_from(0x00).unwrap(), TransmissionType::Data);
        assert_eq!(TransmissionType::try_from(0x01).unwrap(), TransmissionType::Ack);
        assert_eq!(TransmissionType::try_from(0x03).unwrap(), TransmissionType::Ranging);
        assert!(TransmissionType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_frame_start_wraps() {
        assert_eq!(next_frame_start(0, 3), 3);
        assert_eq!(next_frame_start(FRAME_COUNT_ROLLOVER - 1, 1), 0);
        assert_eq!(next_frame_start(FRAME_COUNT_ROLLOVER - 2, 5), 3);
    }

    #[test]
    fn test_ack_for_names_received_frames() {
        let mut data = Transmission::data(1, 2);
        data.rate = 3;
        data.ack_requested = true;
        data.frame_start = FRAME_COUNT_ROLLOVER - 1;
        data.frames = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];

        let ack = Transmission::ack_for(&data, 42);
        assert_eq!(ack.kind, TransmissionType::Ack);
        assert_eq!(ack.src, 2);
        assert_eq!(ack.dest, 1);
        assert_eq!(ack.rate, 3);
        assert_eq!(ack.time, 42);
        assert_eq!(ack.acked_frames, vec![FRAME_COUNT_ROLLOVER - 1, 0]);
        assert!(ack.frames.is_empty());
    }

    #[test]
    fn test_is_empty() {
        let mut tx = Transmission::data(1, 2);
        assert!(tx.is_empty());
        tx.frames.push(Bytes::new());
        assert!(tx.is_empty());
        tx.frames.push(Bytes::from_static(b"x"));
        assert!(!tx.is_empty());
        assert_eq!(tx.payload_len(), 1);
    }
}
