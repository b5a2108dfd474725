//! Channel coding: redundancy added before modulation, checked after.
//!
//! Two codes are available besides the pass-through:
//!
//! - [`ChannelCoding::Crc32`] appends a CRC-32 over the bit length and the
//!   packed bits. It can only detect damage.
//! - [`ChannelCoding::Hamming`] is extended Hamming(8,4): every 4 data bits
//!   travel as an 8-bit codeword that corrects any single flipped bit and
//!   flags any two flipped bits as uncorrectable.
//!
//! # Hamming codeword layout
//!
//! ```text
//! index:  0   1   2   3   4   5   6   7
//! bit:    p1  p2  d1  p3  d2  d3  d4  p0
//! ```
//!
//! `p1..p3` are the classic Hamming(7,4) parity bits (positions 1, 2, 4),
//! `p0` is overall parity across the other seven.

use crate::bitio::{bits_to_bytes, Bits};

/// Number of data bits per Hamming codeword.
const HAMMING_DATA_BITS: usize = 4;

/// Number of coded bits per Hamming codeword.
const HAMMING_CODE_BITS: usize = 8;

/// Number of check bits appended by the CRC code.
const CRC_BITS: usize = 32;

/// Result of decoding a coded bit sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Recovered data bits
    pub bits: Bits,

    /// At least one bit error was repaired
    pub corrected: bool,

    /// The error pattern exceeds what the code can repair
    pub uncorrectable: bool,
}

impl Decoded {
    fn clean(bits: Bits) -> Self {
        Self {
            bits,
            corrected: false,
            uncorrectable: false,
        }
    }
}

/// Error detecting/correcting transform applied to whole frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelCoding {
    /// Bits pass through unchanged
    #[default]
    None,
    /// CRC-32 detection only
    Crc32,
    /// Extended Hamming(8,4) single-error correction, double-error detection
    Hamming,
}

impl ChannelCoding {
    /// Add redundancy.
    ///
    /// For [`ChannelCoding::Hamming`] the data is zero-padded to a multiple
    /// of 4 bits. [`decode`](Self::decode) returns the padded bits; framed
    /// data is always whole bytes, so frames never carry padding.
    pub fn encode(&self, bits: &[bool]) -> Bits {
        match self {
            ChannelCoding::None => bits.to_vec(),
            ChannelCoding::Crc32 => {
                let mut coded = Vec::with_capacity(bits.len() + CRC_BITS);
                coded.extend_from_slice(bits);
                let crc = crc_of(bits);
                coded.extend((0..CRC_BITS).rev().map(|shift| (crc >> shift) & 1 == 1));
                coded
            }
            ChannelCoding::Hamming => {
                let mut coded = Vec::with_capacity(self.encoded_len(bits.len()));
                for chunk in bits.chunks(HAMMING_DATA_BITS) {
                    let mut nibble = [false; HAMMING_DATA_BITS];
                    nibble[..chunk.len()].copy_from_slice(chunk);
                    coded.extend_from_slice(&hamming_encode(nibble));
                }
                coded
            }
        }
    }

    /// Strip redundancy, correcting or flagging damage.
    pub fn decode(&self, coded: &[bool]) -> Decoded {
        match self {
            ChannelCoding::None => Decoded::clean(coded.to_vec()),
            ChannelCoding::Crc32 => {
                if coded.len() < CRC_BITS {
                    return Decoded {
                        bits: Vec::new(),
                        corrected: false,
                        uncorrectable: true,
                    };
                }
                let (data, check) = coded.split_at(coded.len() - CRC_BITS);
                let received = check
                    .iter()
                    .fold(0u32, |acc, &bit| (acc << 1) | bit as u32);
                Decoded {
                    bits: data.to_vec(),
                    corrected: false,
                    uncorrectable: received != crc_of(data),
                }
            }
            ChannelCoding::Hamming => {
                let mut decoded = Decoded::clean(Vec::with_capacity(
                    coded.len() / HAMMING_CODE_BITS * HAMMING_DATA_BITS,
                ));
                let mut codewords = coded.chunks_exact(HAMMING_CODE_BITS);
                for chunk in codewords.by_ref() {
                    let mut word = [false; HAMMING_CODE_BITS];
                    word.copy_from_slice(chunk);
                    let (nibble, status) = hamming_decode(word);
                    decoded.bits.extend_from_slice(&nibble);
                    match status {
                        WordStatus::Clean => {}
                        WordStatus::Corrected => decoded.corrected = true,
                        WordStatus::Uncorrectable => decoded.uncorrectable = true,
                    }
                }
                // A dangling partial codeword cannot be checked.
                if !codewords.remainder().is_empty() {
                    decoded.uncorrectable = true;
                }
                decoded
            }
        }
    }

    /// Coded length for `data_bits` data bits.
    pub fn encoded_len(&self, data_bits: usize) -> usize {
        match self {
            ChannelCoding::None => data_bits,
            ChannelCoding::Crc32 => data_bits + CRC_BITS,
            ChannelCoding::Hamming => {
                data_bits.div_ceil(HAMMING_DATA_BITS) * HAMMING_CODE_BITS
            }
        }
    }

    /// Coded bits needed to recover the first `data_bits` data bits.
    ///
    /// Lets a forwarder read a header without decoding the whole unit.
    pub fn prefix_len(&self, data_bits: usize) -> usize {
        match self {
            ChannelCoding::None | ChannelCoding::Crc32 => data_bits,
            ChannelCoding::Hamming => self.encoded_len(data_bits),
        }
    }

    /// Decode a coded prefix produced by [`prefix_len`](Self::prefix_len).
    ///
    /// The CRC cannot be checked on a prefix, so it passes through unverified.
    pub fn decode_prefix(&self, coded_prefix: &[bool]) -> Decoded {
        match self {
            ChannelCoding::None | ChannelCoding::Crc32 => Decoded::clean(coded_prefix.to_vec()),
            ChannelCoding::Hamming => self.decode(coded_prefix),
        }
    }
}

fn crc_of(bits: &[bool]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&(bits.len() as u32).to_le_bytes());
    hasher.update(&bits_to_bytes(bits));
    hasher.finalize()
}

fn hamming_encode(d: [bool; HAMMING_DATA_BITS]) -> [bool; HAMMING_CODE_BITS] {
    let p1 = d[0] ^ d[1] ^ d[3];
    let p2 = d[0] ^ d[2] ^ d[3];
    let p3 = d[1] ^ d[2] ^ d[3];
    let p0 = p1 ^ p2 ^ d[0] ^ p3 ^ d[1] ^ d[2] ^ d[3];
    [p1, p2, d[0], p3, d[1], d[2], d[3], p0]
}

/// Outcome of checking one codeword.
enum WordStatus {
    Clean,
    Corrected,
    Uncorrectable,
}

fn hamming_decode(mut word: [bool; HAMMING_CODE_BITS]) -> ([bool; HAMMING_DATA_BITS], WordStatus) {
    // Syndrome over positions 1..=7 (indices 0..=6)
    let c = |pos: usize| word[pos - 1] as usize;
    let syndrome = (c(1) ^ c(3) ^ c(5) ^ c(7))
        | (c(2) ^ c(3) ^ c(6) ^ c(7)) << 1
        | (c(4) ^ c(5) ^ c(6) ^ c(7)) << 2;
    let overall = word.iter().fold(false, |acc, &bit| acc ^ bit);

    let status = match (syndrome, overall) {
        (0, false) => WordStatus::Clean,
        // Odd number of flips: assume one and repair it
        (0, true) => {
            word[7] = !word[7];
            WordStatus::Corrected
        }
        (pos, true) => {
            word[pos - 1] = !word[pos - 1];
            WordStatus::Corrected
        }
        // Even number of flips with a non-zero syndrome: at least two errors
        (_, false) => WordStatus::Uncorrectable,
    };

    ([word[2], word[4], word[5], word[6]], status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitio::bytes_to_bits;

    fn sample_bits() -> Bits {
        bytes_to_bits(b"cable")
    }

    #[test]
    fn test_none_is_identity() {
        let bits = sample_bits();
        let coded = ChannelCoding::None.encode(&bits);
        assert_eq!(coded, bits);
        assert_eq!(ChannelCoding::None.decode(&coded), Decoded::clean(bits));
    }

    #[test]
    fn test_crc_clean() {
        let bits = sample_bits();
        let coded = ChannelCoding::Crc32.encode(&bits);
        assert_eq!(coded.len(), bits.len() + 32);

        let decoded = ChannelCoding::Crc32.decode(&coded);
        assert_eq!(decoded.bits, bits);
        assert!(!decoded.uncorrectable);
        assert!(!decoded.corrected);
    }

    #[test]
    fn test_crc_detects_but_does_not_fix() {
        let bits = sample_bits();
        let mut coded = ChannelCoding::Crc32.encode(&bits);
        coded[5] = !coded[5];

        let decoded = ChannelCoding::Crc32.decode(&coded);
        assert!(decoded.uncorrectable);
        assert!(!decoded.corrected);
    }

    #[test]
    fn test_crc_too_short() {
        let decoded = ChannelCoding::Crc32.decode(&[true; 10]);
        assert!(decoded.uncorrectable);
        assert!(decoded.bits.is_empty());
    }

    #[test]
    fn test_crc_distinguishes_trailing_zeros() {
        // Packed bytes are identical, the length prefix is not
        let short = vec![true, false, true];
        let long = vec![true, false, true, false];
        let coded = ChannelCoding::Crc32.encode(&short);
        let mut forged = long.clone();
        forged.extend_from_slice(&coded[short.len()..]);
        assert!(ChannelCoding::Crc32.decode(&forged).uncorrectable);
    }

    #[test]
    fn test_hamming_clean() {
        let bits = sample_bits();
        let coded = ChannelCoding::Hamming.encode(&bits);
        assert_eq!(coded.len(), bits.len() * 2);

        let decoded = ChannelCoding::Hamming.decode(&coded);
        assert_eq!(decoded, Decoded::clean(bits));
    }

    #[test]
    fn test_hamming_corrects_every_single_bit_error() {
        let bits = sample_bits();
        let coded = ChannelCoding::Hamming.encode(&bits);

        for i in 0..coded.len() {
            let mut damaged = coded.clone();
            damaged[i] = !damaged[i];

            let decoded = ChannelCoding::Hamming.decode(&damaged);
            assert_eq!(decoded.bits, bits, "flip at {i}");
            assert!(decoded.corrected);
            assert!(!decoded.uncorrectable);
        }
    }

    #[test]
    fn test_hamming_one_error_per_block() {
        let bits = sample_bits();
        let mut coded = ChannelCoding::Hamming.encode(&bits);
        for block in 0..coded.len() / 8 {
            let i = block * 8 + block % 8;
            coded[i] = !coded[i];
        }

        let decoded = ChannelCoding::Hamming.decode(&coded);
        assert_eq!(decoded.bits, bits);
        assert!(decoded.corrected);
        assert!(!decoded.uncorrectable);
    }

    #[test]
    fn test_hamming_flags_double_errors() {
        let bits = sample_bits();
        let coded = ChannelCoding::Hamming.encode(&bits);

        for a in 0..8 {
            for b in (a + 1)..8 {
                let mut damaged = coded.clone();
                damaged[8 + a] = !damaged[8 + a];
                damaged[8 + b] = !damaged[8 + b];

                let decoded = ChannelCoding::Hamming.decode(&damaged);
                assert!(decoded.uncorrectable, "flips at {a},{b} not flagged");
            }
        }
    }

    #[test]
    fn test_hamming_pads_to_nibbles() {
        let bits = vec![true, true, false];
        let coded = ChannelCoding::Hamming.encode(&bits);
        assert_eq!(coded.len(), 8);
        assert_eq!(
            ChannelCoding::Hamming.decode(&coded).bits,
            vec![true, true, false, false]
        );
    }

    #[test]
    fn test_hamming_partial_codeword_is_uncorrectable() {
        let mut coded = ChannelCoding::Hamming.encode(&sample_bits());
        coded.pop();
        assert!(ChannelCoding::Hamming.decode(&coded).uncorrectable);
    }

    #[test]
    fn test_prefix_decoding() {
        let bits = sample_bits();
        for coding in [ChannelCoding::None, ChannelCoding::Crc32, ChannelCoding::Hamming] {
            let coded = coding.encode(&bits);
            let prefix = coding.prefix_len(16);
            let decoded = coding.decode_prefix(&coded[..prefix]);
            assert_eq!(decoded.bits, bits[..16].to_vec(), "{coding:?}");
        }
    }
}
