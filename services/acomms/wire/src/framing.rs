//! Byte-stuffed stream framing with CRC-16.
//!
//! ```text
//! +-------+----------------+---------+----------+---------+--------------+
//! | 0x7E  | size: u16 LE   | version | reserved | payload | crc: u16 LE  |
//! +-------+----------------+---------+----------+---------+--------------+
//!           `size` counts every unescaped byte after the magic
//! ```
//!
//! Every byte after the magic is escaped: `0x7D` becomes `0x7D 0x5D` and
//! `0x7E` becomes `0x7D 0x5E`, so a raw `0x7E` on the stream always starts a
//! message. The CRC covers the header and payload.

use crate::crc::crc16;
use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

/// Start-of-message marker
pub const MAGIC: u8 = 0x7E;
/// Escape marker
pub const ESCAPE: u8 = 0x7D;
/// Follows [`ESCAPE`] to encode a literal [`MAGIC`]
pub const ESCAPED_MAGIC: u8 = 0x5E;
/// Follows [`ESCAPE`] to encode a literal [`ESCAPE`]
pub const ESCAPED_ESCAPE: u8 = 0x5D;

/// Header bytes after the magic (size, version, reserved)
pub const HEADER_SIZE: usize = 4;
/// Trailing CRC bytes
pub const CRC_SIZE: usize = 2;
/// Smallest valid declared size (empty payload)
pub const MIN_MESSAGE_SIZE: usize = HEADER_SIZE + CRC_SIZE;
/// Default bound on the declared size
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;
/// Framing version carried in the header
pub const FRAMING_VERSION: u8 = 1;

/// Escape `raw` onto the end of `out`
pub fn add_escapes(raw: &[u8], out: &mut BytesMut) {
    for &byte in raw {
        match byte {
            ESCAPE => out.put_slice(&[ESCAPE, ESCAPED_ESCAPE]),
            MAGIC => out.put_slice(&[ESCAPE, ESCAPED_MAGIC]),
            other => out.put_u8(other),
        }
    }
}

/// Undo byte-stuffing.
///
/// Substitutions run in a fixed order: escaped magic first, then escaped
/// escape. Fails if an escape byte is not followed by a valid escape code.
pub fn remove_escapes(escaped: &[u8]) -> Result<Vec<u8>, WireError> {
    check_escapes(escaped)?;
    let pass = replace_pair(escaped, [ESCAPE, ESCAPED_MAGIC], MAGIC);
    Ok(replace_pair(&pass, [ESCAPE, ESCAPED_ESCAPE], ESCAPE))
}

fn check_escapes(escaped: &[u8]) -> Result<(), WireError> {
    let mut bytes = escaped.iter();
    while let Some(&byte) = bytes.next() {
        if byte == ESCAPE {
            match bytes.next() {
                Some(&ESCAPED_MAGIC) | Some(&ESCAPED_ESCAPE) => {}
                _ => return Err(WireError::Escape),
            }
        }
    }
    Ok(())
}

fn replace_pair(input: &[u8], pair: [u8; 2], with: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == pair[0] && input.get(i + 1) == Some(&pair[1]) {
            out.push(with);
            i += 2;
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    out
}

/// Build the unescaped message body (everything after the magic) for `payload`
pub fn build_raw_message(payload: &[u8]) -> Result<BytesMut, WireError> {
    let size = MIN_MESSAGE_SIZE + payload.len();
    if size > u16::MAX as usize {
        return Err(WireError::Size(size));
    }

    let mut raw = BytesMut::with_capacity(size);
    raw.put_u16_le(size as u16);
    raw.put_u8(FRAMING_VERSION);
    raw.put_u8(0);
    raw.put_slice(payload);
    let crc = crc16(&raw);
    raw.put_u16_le(crc);
    Ok(raw)
}

/// Prefix the magic and escape an unescaped message body
pub fn frame_raw_message(raw: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(1 + raw.len() + raw.len() / 8);
    out.put_u8(MAGIC);
    add_escapes(raw, &mut out);
    out.freeze()
}

/// Frame a payload for the byte stream
pub fn encode_message(payload: &[u8]) -> Result<Bytes, WireError> {
    let raw = build_raw_message(payload)?;
    Ok(frame_raw_message(&raw))
}

/// Read phases of the stream decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    /// Scanning for the magic byte
    Magic,
    /// Reading the fixed-size header
    Header,
    /// Reading the rest of the declared message
    Complete,
}

/// Incremental decoder for byte-stuffed messages.
///
/// Feed it whatever the channel produced; it consumes bytes from the buffer
/// and yields payloads as messages complete. Escapes seen within the current
/// message extend each phase's read by the number of newly observed escapes.
#[derive(Debug)]
pub struct StreamDecoder {
    max_message_size: usize,
    phase: ReadPhase,
    buffer: BytesMut,
    remaining: usize,
    escapes_seen: usize,
    declared_size: usize,
}

impl StreamDecoder {
    /// Create a decoder with the default size bound
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a decoder bounding the declared size
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            max_message_size: max_message_size.clamp(MIN_MESSAGE_SIZE, u16::MAX as usize),
            phase: ReadPhase::Magic,
            buffer: BytesMut::new(),
            remaining: 0,
            escapes_seen: 0,
            declared_size: 0,
        }
    }

    /// Current read phase
    pub fn phase(&self) -> ReadPhase {
        self.phase
    }

    /// Drop any partial message and scan for the next magic byte
    pub fn reset(&mut self) {
        self.phase = ReadPhase::Magic;
        self.buffer.clear();
        self.remaining = 0;
        self.escapes_seen = 0;
        self.declared_size = 0;
    }

    /// Decode at most one message from `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. After an error the
    /// decoder is back in [`ReadPhase::Magic`] and may be called again on the
    /// same buffer.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        loop {
            match self.phase {
                ReadPhase::Magic => match src.iter().position(|&b| b == MAGIC) {
                    Some(pos) => {
                        if pos > 0 {
                            trace!("Discarded {} bytes before magic", pos);
                        }
                        src.advance(pos + 1);
                        self.begin_message();
                    }
                    None => {
                        if !src.is_empty() {
                            trace!("Discarded {} bytes without magic", src.len());
                        }
                        src.clear();
                        return Ok(None);
                    }
                },
                ReadPhase::Header | ReadPhase::Complete => {
                    if !self.fill(src) {
                        return Ok(None);
                    }

                    if self.extend_for_escapes() {
                        continue;
                    }

                    if self.phase == ReadPhase::Header {
                        if let Err(e) = self.finish_header() {
                            self.reset();
                            return Err(e);
                        }
                    } else {
                        let result = self.finish_message();
                        self.reset();
                        return result.map(Some);
                    }
                }
            }
        }
    }

    fn begin_message(&mut self) {
        self.buffer.clear();
        self.buffer.put_u8(MAGIC);
        self.phase = ReadPhase::Header;
        self.remaining = HEADER_SIZE;
        self.escapes_seen = 0;
        self.declared_size = 0;
    }

    /// Move up to `remaining` bytes into the message buffer
    fn fill(&mut self, src: &mut BytesMut) -> bool {
        while self.remaining > 0 {
            let Some(&byte) = src.first() else {
                return false;
            };
            src.advance(1);

            if byte == MAGIC {
                debug!("Magic byte inside message, restarting at new message");
                self.begin_message();
                continue;
            }

            self.buffer.put_u8(byte);
            self.remaining -= 1;
        }
        true
    }

    fn extend_for_escapes(&mut self) -> bool {
        let escapes = self.buffer[1..].iter().filter(|&&b| b == ESCAPE).count();
        if escapes > self.escapes_seen {
            self.remaining = escapes - self.escapes_seen;
            self.escapes_seen = escapes;
            true
        } else {
            false
        }
    }

    fn finish_header(&mut self) -> Result<(), WireError> {
        let header = remove_escapes(&self.buffer[1..])?;
        if header.len() != HEADER_SIZE {
            return Err(WireError::Malformed);
        }

        let size = u16::from_le_bytes([header[0], header[1]]) as usize;
        if header[2] != FRAMING_VERSION {
            return Err(WireError::Version(header[2]));
        }
        if !(MIN_MESSAGE_SIZE..=self.max_message_size).contains(&size) {
            return Err(WireError::Size(size));
        }

        self.declared_size = size;
        self.phase = ReadPhase::Complete;
        self.remaining = size - HEADER_SIZE;
        Ok(())
    }

    fn finish_message(&mut self) -> Result<Bytes, WireError> {
        let raw = remove_escapes(&self.buffer[1..])?;
        if raw.len() != self.declared_size {
            return Err(WireError::Malformed);
        }

        let crc_at = raw.len() - CRC_SIZE;
        let expected = u16::from_le_bytes([raw[crc_at], raw[crc_at + 1]]);
        let computed = crc16(&raw[..crc_at]);
        if expected != computed {
            return Err(WireError::Crc { expected, computed });
        }

        Ok(Bytes::copy_from_slice(&raw[HEADER_SIZE..crc_at]))
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}
