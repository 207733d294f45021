//! FCS-16 (Frame Check Sequence) for the asynchronous IrLAP wrapper.
//!
//! IrLAP uses the bit-reflected CRC-16/CCITT (the X.25 FCS):
//! - Polynomial: x^16 + x^12 + x^5 + 1, reflected form 0x8408
//! - Initial value: 0xFFFF
//! - XOR output: 0xFFFF
//!
//! The FCS is appended least significant byte first.

/// Reflected FCS-16 polynomial.
pub const FCS16_POLYNOMIAL: u16 = 0x8408;

/// FCS-16 initial value.
pub const FCS16_INIT: u16 = 0xFFFF;

/// FCS-16 XOR output value.
pub const FCS16_XOR_OUTPUT: u16 = 0xFFFF;

/// Size of the FCS on the wire.
pub const FCS_SIZE: usize = 2;

const BITS_PER_BYTE: u32 = 8;

/// Incremental FCS-16 computation.
///
/// Used where the checked data is split across several buffers, e.g. a frame
/// header followed by payload fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fcs16 {
    state: u16,
}

impl Fcs16 {
    pub const fn new() -> Self {
        Self { state: FCS16_INIT }
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.state ^= byte as u16;
            for _ in 0..BITS_PER_BYTE {
                if self.state & 1 != 0 {
                    self.state = (self.state >> 1) ^ FCS16_POLYNOMIAL;
                } else {
                    self.state >>= 1;
                }
            }
        }
    }

    /// Returns the complemented FCS.
    pub const fn finish(self) -> u16 {
        self.state ^ FCS16_XOR_OUTPUT
    }
}

impl Default for Fcs16 {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the FCS-16 of `data` in one go.
///
/// # Examples
///
/// ```
/// # use irlap::crc::compute_fcs;
/// assert_eq!(compute_fcs(b"123456789"), 0x906E);
/// ```
pub fn compute_fcs(data: &[u8]) -> u16 {
    let mut fcs = Fcs16::new();
    fcs.update(data);
    fcs.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fcs_check_value() {
        // Standard check input for CRC-16/X-25
        assert_eq!(compute_fcs(b"123456789"), 0x906E);
    }

    #[test]
    fn test_fcs_empty() {
        assert_eq!(compute_fcs(&[]), FCS16_INIT ^ FCS16_XOR_OUTPUT);
    }

    #[test]
    fn test_fcs_incremental_matches_oneshot() {
        let data = [0xFF, 0x2F, 0x01, 0x78, 0x56, 0x34, 0x12, 0xC0, 0x7D, 0xC1];
        let mut fcs = Fcs16::new();
        fcs.update(&data[..2]);
        fcs.update(&data[2..7]);
        fcs.update(&data[7..]);
        assert_eq!(fcs.finish(), compute_fcs(&data));
    }

    #[test]
    fn test_fcs_single_byte() {
        assert_ne!(compute_fcs(&[0xFF]), compute_fcs(&[0x00]));
    }

    #[test]
    fn test_fcs_detects_single_bit_flip() {
        let data = [0xFE, 0x63, 0x11, 0x22, 0x33, 0x44];
        let reference = compute_fcs(&data);
        for i in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data;
                flipped[i] ^= 1 << bit;
                assert_ne!(compute_fcs(&flipped), reference, "byte {} bit {}", i, bit);
            }
        }
    }
}
