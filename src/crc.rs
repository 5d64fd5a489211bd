//! CRC-8 encoder and verifier used for wire frame trailers.
//!
//! The generator is `x^8 + x^7 + x^4 + x^3 + x + 1` in its reversed
//! representation, and the register starts at all ones so a frame full of
//! zeroes does not checksum to zero.

const GNPOLY: u8 = 0xd9;

fn crc8_update(crc: u8, data: u8) -> u8 {
    let mut crc = crc ^ data;
    for _ in 0..8 {
        crc = if crc & 0x1 != 0 {
            (crc >> 1) ^ GNPOLY
        } else {
            crc >> 1
        };
    }
    crc
}

/// Computes the CRC8 of `data`.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0xff, |crc, &b| crc8_update(crc, b))
}

/// Returns `true` if the last octet of `data` is the CRC8 of the octets before it.
///
/// The check runs the encoder over the whole buffer, trailer included, and
/// expects a zero remainder. An empty buffer never verifies.
pub fn verify8(data: &[u8]) -> bool {
    !data.is_empty() && crc8(data) == 0
}
