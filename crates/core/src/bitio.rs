//! Bit sequences and fixed-width field I/O.
//!
//! Every layer above the signal codec exchanges [`Bits`]: an ordered
//! sequence of binary symbols, MSB-first. [`BitWriter`] and [`BitReader`]
//! pack and unpack fixed-width header fields into such sequences.
//!
//! # Example
//! ```
//! use cablenet_core::bitio::{BitReader, BitWriter};
//!
//! let mut writer = BitWriter::new();
//! writer.write_bits(0b101, 3).unwrap();
//! writer.write_bytes(b"A");
//! let bits = writer.finish();
//! assert_eq!(bits.len(), 11);
//!
//! let mut reader = BitReader::new(&bits);
//! assert_eq!(reader.read_bits(3).unwrap(), 0b101);
//! assert_eq!(reader.read_bytes(1).unwrap(), b"A");
//! ```

use crate::error::{BitIoError, Result};

/// An ordered, finite sequence of bits.
pub type Bits = Vec<bool>;

/// Expand bytes into bits, MSB of the first byte first.
pub fn bytes_to_bits(bytes: &[u8]) -> Bits {
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for &byte in bytes {
        for shift in (0..8).rev() {
            bits.push((byte >> shift) & 1 == 1);
        }
    }
    bits
}

/// Pack bits into bytes MSB-first.
///
/// A trailing partial byte is padded with zero bits.
pub fn bits_to_bytes(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &bit)| acc | ((bit as u8) << (7 - i)))
        })
        .collect()
}

/// Count positions where two bit sequences differ.
///
/// Bits present in only one of the sequences count as errors, so a
/// truncated reception is never mistaken for a clean one.
pub fn count_bit_errors(sent: &[bool], received: &[bool]) -> usize {
    let overlap = sent.iter().zip(received).filter(|(a, b)| a != b).count();
    overlap + sent.len().abs_diff(received.len())
}

/// Writes fixed-width fields MSB-first into a bit sequence.
#[derive(Debug, Clone, Default)]
pub struct BitWriter {
    bits: Bits,
}

impl BitWriter {
    /// Create a writer with empty output.
    pub fn new() -> Self {
        Self { bits: Vec::new() }
    }

    /// Create a writer with room for `bits` bits.
    pub fn with_capacity(bits: usize) -> Self {
        Self {
            bits: Vec::with_capacity(bits),
        }
    }

    /// Write the lowest `count` bits of `value`, most significant first.
    ///
    /// # Errors
    /// Returns `BitIoError::InvalidBitCount` if count > 64.
    pub fn write_bits(&mut self, value: u64, count: usize) -> Result<()> {
        if count > 64 {
            return Err(BitIoError::InvalidBitCount(count).into());
        }

        for shift in (0..count).rev() {
            self.bits.push((value >> shift) & 1 == 1);
        }

        Ok(())
    }

    /// Write one byte as an 8-bit field.
    pub fn write_u8(&mut self, value: u8) {
        self.bits.extend(bytes_to_bits(&[value]));
    }

    /// Write a 16-bit field, high byte first.
    pub fn write_u16(&mut self, value: u16) {
        self.bits.extend(bytes_to_bits(&value.to_be_bytes()));
    }

    /// Append whole bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.bits.extend(bytes_to_bits(bytes));
    }

    /// Finish writing and return the bit sequence.
    pub fn finish(self) -> Bits {
        self.bits
    }

    /// Number of bits written so far.
    pub fn bit_len(&self) -> usize {
        self.bits.len()
    }
}

/// Reads fixed-width fields MSB-first from a bit sequence.
///
/// # Invariants
/// - `position` never exceeds `bits.len()`
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    bits: &'a [bool],
    position: usize,
}

impl<'a> BitReader<'a> {
    /// Create a reader over the given bits.
    pub fn new(bits: &'a [bool]) -> Self {
        Self { bits, position: 0 }
    }

    /// Read up to 64 bits as an unsigned value.
    ///
    /// # Errors
    /// - `BitIoError::InvalidBitCount` if count > 64
    /// - `BitIoError::UnexpectedEof` if not enough bits remain
    pub fn read_bits(&mut self, count: usize) -> Result<u64> {
        if count > 64 {
            return Err(BitIoError::InvalidBitCount(count).into());
        }
        if count > self.bits_remaining() {
            return Err(BitIoError::UnexpectedEof.into());
        }

        let field = &self.bits[self.position..self.position + count];
        self.position += count;

        Ok(field.iter().fold(0u64, |acc, &bit| (acc << 1) | bit as u64))
    }

    /// Read a single bit.
    pub fn read_bit(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    /// Read `count` whole bytes.
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let needed = count * 8;
        if needed > self.bits_remaining() {
            return Err(BitIoError::UnexpectedEof.into());
        }

        let bytes = bits_to_bytes(&self.bits[self.position..self.position + needed]);
        self.position += needed;
        Ok(bytes)
    }

    /// Number of unread bits.
    pub fn bits_remaining(&self) -> usize {
        self.bits.len() - self.position
    }

    /// Current read position in bits.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Whether every bit has been read.
    pub fn is_empty(&self) -> bool {
        self.position >= self.bits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_bits_msb_first() {
        let bits = bytes_to_bits(&[0b1011_0010]);
        assert_eq!(
            bits,
            vec![true, false, true, true, false, false, true, false]
        );
    }

    #[test]
    fn test_bits_to_bytes_pads_last_byte() {
        let bytes = bits_to_bytes(&[true, false, true]);
        assert_eq!(bytes, vec![0b1010_0000]);
    }

    #[test]
    fn test_bytes_bits_bytes() {
        let data = b"HI there";
        assert_eq!(bits_to_bytes(&bytes_to_bits(data)), data.to_vec());
    }

    #[test]
    fn test_write_read_fields() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b101, 3).unwrap();
        writer.write_bits(0xBEEF, 16).unwrap();
        writer.write_bits(1, 1).unwrap();
        let bits = writer.finish();
        assert_eq!(bits.len(), 20);

        let mut reader = BitReader::new(&bits);
        assert_eq!(reader.read_bits(3).unwrap(), 0b101);
        assert_eq!(reader.read_bits(16).unwrap(), 0xBEEF);
        assert!(reader.read_bit().unwrap());
        assert!(reader.is_empty());
    }

    #[test]
    fn test_fixed_width_writers() {
        let mut writer = BitWriter::new();
        writer.write_u8(0xA5);
        writer.write_u16(0x0102);
        assert_eq!(writer.bit_len(), 24);

        let bits = writer.finish();
        let mut reader = BitReader::new(&bits);
        assert_eq!(reader.read_bits(8).unwrap(), 0xA5);
        assert_eq!(reader.read_bits(16).unwrap(), 0x0102);
    }

    #[test]
    fn test_64_bit_values() {
        let mut writer = BitWriter::new();
        let val = 0x1234_5678_9ABC_DEF0u64;
        writer.write_bits(val, 64).unwrap();

        let bits = writer.finish();
        let mut reader = BitReader::new(&bits);
        assert_eq!(reader.read_bits(64).unwrap(), val);
    }

    #[test]
    fn test_invalid_bit_count() {
        let mut writer = BitWriter::new();
        assert!(writer.write_bits(0, 65).is_err());

        let bits = vec![false; 100];
        let mut reader = BitReader::new(&bits);
        assert!(reader.read_bits(65).is_err());
    }

    #[test]
    fn test_read_past_end() {
        let bits = bytes_to_bits(&[0xAA]);
        let mut reader = BitReader::new(&bits);

        assert_eq!(reader.read_bits(8).unwrap(), 0xAA);
        assert!(reader.read_bits(1).is_err());
        assert!(reader.read_bytes(1).is_err());
    }

    #[test]
    fn test_bits_remaining() {
        let bits = vec![true; 16];
        let mut reader = BitReader::new(&bits);

        assert_eq!(reader.bits_remaining(), 16);
        reader.read_bits(5).unwrap();
        assert_eq!(reader.bits_remaining(), 11);
        assert_eq!(reader.position(), 5);
        reader.read_bits(11).unwrap();
        assert!(reader.is_empty());
    }

    #[test]
    fn test_count_bit_errors() {
        let sent = vec![true, false, true, true];
        assert_eq!(count_bit_errors(&sent, &sent), 0);
        assert_eq!(count_bit_errors(&sent, &[true, true, true, false]), 2);
        // Missing bits count as errors
        assert_eq!(count_bit_errors(&sent, &[true, false]), 2);
    }
}
