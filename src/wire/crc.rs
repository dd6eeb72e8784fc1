//! CRC-16/CCITT-FALSE checksum for wire chunks.

/// Initial register value.
const SEED: u16 = 0xFFFF;

/// Compute the CRC-16/CCITT-FALSE of `data` (poly 0x1021, seed 0xFFFF, no reflection).
///
/// Table-less: each byte is folded into the register with the nibble trick
/// instead of eight shift rounds.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(SEED, |crc, &byte| {
        let mut x = ((crc >> 8) as u8) ^ byte;
        x ^= x >> 4;
        let x = u16::from(x);
        (crc << 8) ^ (x << 12) ^ (x << 5) ^ x
    })
}
