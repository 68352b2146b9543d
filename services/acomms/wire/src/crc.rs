//! CRC-16 used by the byte-stuffed stream framing.
//!
//! Reflected polynomial 0xA001, zero seed, processed LSB first
//! (the CRC-16/ARC parameterisation).

/// Reflected generator polynomial
pub const CRC16_POLY: u16 = 0xA001;

/// Compute the CRC-16 of `data`
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(0, data)
}

/// Continue a CRC-16 computation over more bytes
pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC16_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}
