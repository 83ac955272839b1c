//! Packed record format: one 32-bit flash slot holds a CRC-protected
//! (identifier, data) pair, little-endian: byte 0 is the CRC over the three
//! remaining bytes, byte 1 the identifier, bytes 2-3 the data.

use crate::crc;

/// Value a slot reads back as after a page erase.
pub const ERASED: u32 = 0xffff_ffff;

/// Identifier that can never be stored: an erased slot reads back with it.
pub const RESERVED_ID: u8 = 0xFF;

/// A single record slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Record {
    word: u32,
}

impl Record {
    /// Pack `identifier` and `data`, computing the protecting CRC.
    pub fn new(identifier: u8, data: u16) -> Record {
        let crc = crc::checksum(&payload(identifier, data));
        Record {
            word: u32::from(crc) | u32::from(identifier) << 8 | u32::from(data) << 16,
        }
    }

    /// Reinterpret a word read from flash.
    pub fn from_word(word: u32) -> Record {
        Record { word }
    }

    pub fn word(self) -> u32 {
        self.word
    }

    /// Lower programming half: CRC and identifier.
    pub fn low(self) -> u16 {
        self.word as u16
    }

    /// Upper programming half: the data.
    pub fn high(self) -> u16 {
        (self.word >> 16) as u16
    }

    pub fn crc(self) -> u8 {
        self.word as u8
    }

    pub fn id(self) -> u8 {
        (self.word >> 8) as u8
    }

    pub fn data(self) -> u16 {
        (self.word >> 16) as u16
    }

    /// `true` for the erased sentinel, a slot nothing was programmed into.
    pub fn is_erased(self) -> bool {
        self.word == ERASED
    }

    /// Recompute the CRC and compare with the stored one. The data itself is
    /// handed out either way, the caller decides what a mismatch means.
    pub fn verify(self) -> bool {
        self.crc() == crc::checksum(&payload(self.id(), self.data()))
    }
}

fn payload(identifier: u8, data: u16) -> [u8; 3] {
    [identifier, data as u8, (data >> 8) as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_little_endian() {
        // crc(0x10, 0xCD, 0xAB) = 0x1F
        assert_eq!(0xABCD_101F, Record::new(0x10, 0xABCD).word());
        assert_eq!(0x1234_4280, Record::new(0x42, 0x1234).word());
    }

    #[test]
    fn unpacks_fields() {
        let record = Record::new(0x10, 0xABCD);
        assert_eq!(0x10, record.id());
        assert_eq!(0xABCD, record.data());
        assert_eq!(0x1F, record.crc());
        assert_eq!(0x101F, record.low());
        assert_eq!(0xABCD, record.high());
        assert!(record.verify());
        assert!(!record.is_erased());
    }

    #[test]
    fn erased_sentinel() {
        let erased = Record::from_word(ERASED);
        assert!(erased.is_erased());
        assert_eq!(RESERVED_ID, erased.id());
    }

    #[test]
    fn verify_catches_damage() {
        let word = Record::new(0x10, 0xABCD).word();
        assert!(!Record::from_word(word ^ 0x0001_0000).verify()); // data bit
        assert!(!Record::from_word(word ^ 0x0000_0100).verify()); // id bit
        assert!(!Record::from_word(word ^ 0x0000_0001).verify()); // crc bit
    }
}
