//! Frame format, addressing and segmentation.
//!
//! A frame is a fixed-width header followed by the payload bytes, all
//! carried as bits. There are no delimiters: the signal codec preserves the
//! exact bit count, so the length field is enough to validate a frame.
//!
//! # Frame Format
//!
//! ```text
//! +----------------------+
//! | source (8)           |  sender address
//! +----------------------+
//! | destination (8)      |  receiver address
//! +----------------------+
//! | kind (8)             |  0 = Data, 1 = Ack, 2 = Nack
//! +----------------------+
//! | sequence (8)         |  transport sequence number
//! +----------------------+
//! | window_base (8)      |  sender's oldest unacknowledged sequence number
//! +----------------------+
//! | message_id (16)      |  groups the fragments of one message
//! +----------------------+
//! | fragment_index (8)   |  0-based
//! +----------------------+
//! | fragment_count (8)   |  >= 1
//! +----------------------+
//! | payload_len (16)     |  bytes of payload that follow
//! +----------------------+
//! | checksum (16)        |  low 16 bits of CRC-32 over everything else
//! +----------------------+
//! | payload              |  payload_len bytes
//! +----------------------+
//! ```
//!
//! Source and destination come first so a forwarder can read them from the
//! first 16 bits alone (see [`peek_addresses`]).

use std::fmt;

use crate::bitio::{BitReader, BitWriter, Bits};
use crate::error::{FramingError, Result, TransportError};

/// Header size in bits: seven 8-bit fields and three 16-bit fields
pub const HEADER_BITS: usize = 104;

/// Bits needed to read source and destination
pub const ADDRESS_PREFIX_BITS: usize = 16;

/// Most fragments a single message can be split into
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// Host address on the switched network.
///
/// `Address(0)` is reserved as "unassigned" and is never bound to a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub u8);

impl Address {
    pub const UNASSIGNED: Address = Address(0);

    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data,
    Ack,
    Nack,
}

impl FrameKind {
    fn tag(self) -> u8 {
        match self {
            FrameKind::Data => 0,
            FrameKind::Ack => 1,
            FrameKind::Nack => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(FrameKind::Data),
            1 => Some(FrameKind::Ack),
            2 => Some(FrameKind::Nack),
            _ => None,
        }
    }
}

/// Fixed-width frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub source: Address,
    pub destination: Address,
    pub kind: FrameKind,
    pub sequence: u8,
    pub window_base: u8,
    pub message_id: u16,
    pub fragment_index: u8,
    pub fragment_count: u8,
    pub payload_len: u16,
}

/// A parsed or outgoing frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a data frame. `payload_len` is taken from the payload.
    #[allow(clippy::too_many_arguments)]
    pub fn data(
        source: Address,
        destination: Address,
        sequence: u8,
        window_base: u8,
        message_id: u16,
        fragment_index: u8,
        fragment_count: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            header: FrameHeader {
                source,
                destination,
                kind: FrameKind::Data,
                sequence,
                window_base,
                message_id,
                fragment_index,
                fragment_count,
                payload_len: payload.len() as u16,
            },
            payload,
        }
    }

    /// Acknowledge `sequence` back to `destination`.
    pub fn ack(source: Address, destination: Address, sequence: u8, message_id: u16) -> Self {
        Self::control(FrameKind::Ack, source, destination, sequence, message_id)
    }

    /// Ask `destination` to retransmit `sequence` now.
    pub fn nack(source: Address, destination: Address, sequence: u8, message_id: u16) -> Self {
        Self::control(FrameKind::Nack, source, destination, sequence, message_id)
    }

    fn control(
        kind: FrameKind,
        source: Address,
        destination: Address,
        sequence: u8,
        message_id: u16,
    ) -> Self {
        Self {
            header: FrameHeader {
                source,
                destination,
                kind,
                sequence,
                window_base: 0,
                message_id,
                fragment_index: 0,
                fragment_count: 1,
                payload_len: 0,
            },
            payload: Vec::new(),
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }

    /// Serialize to bits, computing the checksum.
    pub fn serialize(&self) -> Bits {
        let mut writer = BitWriter::with_capacity(HEADER_BITS + self.payload.len() * 8);
        let checksum = checksum(&self.header, &self.payload);
        write_header(&mut writer, &self.header, checksum);
        debug_assert_eq!(writer.bit_len(), HEADER_BITS);
        writer.write_bytes(&self.payload);
        writer.finish()
    }

    /// Parse a frame from bits.
    ///
    /// # Errors
    /// - `FramingError::FrameTooShort` if the header is incomplete
    /// - `FramingError::InvalidKind` for an unknown kind tag
    /// - `FramingError::InvalidFragment` if the index is not below the count
    /// - `FramingError::PayloadLengthMismatch` if the length field disagrees
    ///   with the bits that follow the header
    /// - `FramingError::ChecksumMismatch` (carrying the parsed header) if the
    ///   structure is valid but the content was damaged
    pub fn deserialize(bits: &[bool]) -> Result<Self> {
        if bits.len() < HEADER_BITS {
            return Err(FramingError::FrameTooShort {
                required: HEADER_BITS,
                actual: bits.len(),
            }
            .into());
        }

        let mut reader = BitReader::new(bits);
        let source = Address(reader.read_bits(8)? as u8);
        let destination = Address(reader.read_bits(8)? as u8);
        let tag = reader.read_bits(8)? as u8;
        let kind = FrameKind::from_tag(tag).ok_or(FramingError::InvalidKind(tag))?;
        let sequence = reader.read_bits(8)? as u8;
        let window_base = reader.read_bits(8)? as u8;
        let message_id = reader.read_bits(16)? as u16;
        let fragment_index = reader.read_bits(8)? as u8;
        let fragment_count = reader.read_bits(8)? as u8;
        let payload_len = reader.read_bits(16)? as u16;
        let received = reader.read_bits(16)? as u16;

        if fragment_index >= fragment_count {
            return Err(FramingError::InvalidFragment {
                index: fragment_index,
                count: fragment_count,
            }
            .into());
        }

        let expected_bits = payload_len as usize * 8;
        if reader.bits_remaining() != expected_bits {
            return Err(FramingError::PayloadLengthMismatch {
                expected: expected_bits,
                actual: reader.bits_remaining(),
            }
            .into());
        }
        let payload = reader.read_bytes(payload_len as usize)?;

        let header = FrameHeader {
            source,
            destination,
            kind,
            sequence,
            window_base,
            message_id,
            fragment_index,
            fragment_count,
            payload_len,
        };

        let computed = checksum(&header, &payload);
        if computed != received {
            return Err(FramingError::ChecksumMismatch {
                header,
                expected: computed,
                actual: received,
            }
            .into());
        }

        Ok(Self { header, payload })
    }
}

/// Read source and destination from the front of a serialized frame.
///
/// Returns `None` if fewer than 16 bits are available. Nothing else is
/// validated.
pub fn peek_addresses(bits: &[bool]) -> Option<(Address, Address)> {
    if bits.len() < ADDRESS_PREFIX_BITS {
        return None;
    }
    let mut reader = BitReader::new(bits);
    let source = reader.read_bits(8).ok()? as u8;
    let destination = reader.read_bits(8).ok()? as u8;
    Some((Address(source), Address(destination)))
}

/// Split a message into payload-sized fragments.
///
/// An empty message still produces one (empty) fragment so it can be
/// delivered.
///
/// # Errors
/// `TransportError::MessageTooLarge` if more than 255 fragments are needed.
pub fn segment(data: &[u8], max_payload: usize) -> Result<Vec<Vec<u8>>> {
    let max_payload = max_payload.max(1);
    let max_len = max_payload * MAX_FRAGMENTS;
    if data.len() > max_len {
        return Err(TransportError::MessageTooLarge {
            len: data.len(),
            max: max_len,
        }
        .into());
    }

    if data.is_empty() {
        return Ok(vec![Vec::new()]);
    }

    Ok(data.chunks(max_payload).map(<[u8]>::to_vec).collect())
}

fn write_header(writer: &mut BitWriter, header: &FrameHeader, checksum: u16) {
    writer.write_u8(header.source.0);
    writer.write_u8(header.destination.0);
    writer.write_u8(header.kind.tag());
    writer.write_u8(header.sequence);
    writer.write_u8(header.window_base);
    writer.write_u16(header.message_id);
    writer.write_u8(header.fragment_index);
    writer.write_u8(header.fragment_count);
    writer.write_u16(header.payload_len);
    writer.write_u16(checksum);
}

fn checksum(header: &FrameHeader, payload: &[u8]) -> u16 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[
        header.source.0,
        header.destination.0,
        header.kind.tag(),
        header.sequence,
        header.window_base,
    ]);
    hasher.update(&header.message_id.to_be_bytes());
    hasher.update(&[header.fragment_index, header.fragment_count]);
    hasher.update(&header.payload_len.to_be_bytes());
    hasher.update(payload);
    (hasher.finalize() & 0xFFFF) as u16
}
