//! CRC-8 protecting stored records against bit rot.
//!
//! Reversed CRC-8-CCITT, polynomial `0xE0`. Hamming distance is 4 for
//! payloads up to 119 bits, enough to catch any single-bit error in the
//! 3-byte record payload.

const POLYNOMIAL: u8 = 0xE0;

static TABLE: [u8; 256] = build_table(POLYNOMIAL);

const fn build_table(polynomial: u8) -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut remainder: u8 = 0x01;
    let mut i: usize = 128;
    while i > 0 {
        if remainder & 0x01 != 0 {
            remainder = (remainder >> 1) ^ polynomial;
        } else {
            remainder >>= 1;
        }
        let mut j = 0;
        while j < 256 {
            table[i + j] = remainder ^ table[j];
            j += 2 * i;
        }
        i >>= 1;
    }
    table
}

/// Checksum of `payload`, bit-exact with what existing devices carry in
/// flash: the remainder is kept 16 bits wide and seeded with `0xFFFF`, so
/// the byte folded back in differs from a plain table lookup on the first
/// two iterations. Do not "simplify".
pub fn checksum(payload: &[u8]) -> u8 {
    let mut remainder: u16 = 0xFFFF;
    for &byte in payload {
        let index = byte ^ (remainder as u8);
        remainder >>= 8;
        remainder ^= u16::from(TABLE[usize::from(index)]);
    }
    remainder as u8
}
