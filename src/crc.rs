//! Frame checksum.
//!
//! The STM32 CRC unit runs CRC-32/MPEG-2 over 32-bit words. The bootloader
//! feeds it one frame byte per word, zero-extended, so a host computing the
//! checksum in software must do the same.

use crc::{Crc, CRC_32_MPEG_2};

static STM32_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Reset value of the accumulator
pub const CRC_SEED: u32 = 0xFFFF_FFFF;

/// A word-oriented CRC accumulator, modelled on the STM32 CRC peripheral
pub trait CrcUnit {
    /// Return the accumulator to its seed value
    fn reset(&mut self);

    /// Feed one word, returning the updated accumulator value
    fn accumulate(&mut self, word: u32) -> u32;
}

/// Software implementation of the CRC peripheral
#[derive(Debug, Clone)]
pub struct SoftCrc {
    value: u32,
}

impl SoftCrc {
    pub fn new() -> Self {
        Self { value: CRC_SEED }
    }
}

impl Default for SoftCrc {
    fn default() -> Self {
        Self::new()
    }
}

impl CrcUnit for SoftCrc {
    fn reset(&mut self) {
        self.value = CRC_SEED;
    }

    fn accumulate(&mut self, word: u32) -> u32 {
        // The peripheral shifts words in MSB first
        let mut digest = STM32_CRC.digest_with_initial(self.value);
        digest.update(&word.to_be_bytes());
        self.value = digest.finalize();
        self.value
    }
}

/// Run `unit` over `data` from a fresh seed, one byte per word
pub fn compute<C: CrcUnit>(unit: &mut C, data: &[u8]) -> u32 {
    unit.reset();

    let mut value = CRC_SEED;
    for b in data {
        value = unit.accumulate(*b as u32);
    }

    unit.reset();
    value
}

/// Check `data` against the checksum supplied by the host
pub fn verify<C: CrcUnit>(unit: &mut C, data: &[u8], expected: u32) -> bool {
    compute(unit, data) == expected
}

/// Checksum of `data` as the bootloader computes it
pub fn checksum(data: &[u8]) -> u32 {
    compute(&mut SoftCrc::new(), data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_word_reference() {
        // CRC unit reference value for a single 0x00000000 word
        let mut unit = SoftCrc::new();
        assert_eq!(unit.accumulate(0), 0xC704_DD7B);
    }

    #[test]
    fn test_matches_byte_stream() {
        // One byte per word is the same as three zero bytes before each byte
        let data = [0x05u8, 0x51];
        let mut expanded = Vec::new();
        for b in data.iter() {
            expanded.extend_from_slice(&[0, 0, 0, *b]);
        }
        assert_eq!(checksum(&data), STM32_CRC.checksum(&expanded));
    }

    #[test]
    fn test_empty_is_seed() {
        assert_eq!(checksum(&[]), CRC_SEED);
    }

    #[test]
    fn test_verify_resets_between_calls() {
        let mut unit = SoftCrc::new();
        let a = [0x05u8, 0x51];
        let b = [0x05u8, 0x53];
        let crc_a = checksum(&a);
        let crc_b = checksum(&b);

        // Leave the unit dirty before verifying
        unit.accumulate(0xDEAD_BEEF);

        assert!(verify(&mut unit, &a, crc_a));
        assert!(verify(&mut unit, &b, crc_b));
        assert!(verify(&mut unit, &a, crc_a));
        assert!(!verify(&mut unit, &a, crc_b));
    }

    #[test]
    fn test_verify_detects_corruption() {
        let data = [0x07u8, 0x56, 0x03, 0x02];
        let crc = checksum(&data);
        let mut unit = SoftCrc::new();
        assert!(!verify(&mut unit, &data, crc ^ 1));
        assert!(!verify(&mut unit, &data[..3], crc));
    }
}
