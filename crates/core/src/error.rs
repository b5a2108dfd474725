//! Error types for the cablenet stack.
//!
//! All operations return structured errors rather than panicking. A noisy
//! cable is the normal case here, so most of these errors are counted and
//! recovered from (by correction or retransmission) instead of aborting.

use crate::frame::{Address, FrameHeader};
use thiserror::Error;

/// Top-level error type for all operations in the system.
///
/// Each variant corresponds to one layer of the stack:
/// - Bit I/O: reading/writing fixed-width fields from/to bit sequences
/// - Codec: waveform modulation/demodulation
/// - Coding: channel coder could not recover the transmitted bits
/// - Framing: frame header/payload parsing
/// - Reassembly: fragment collection
/// - Switch: forwarding decisions
/// - Transport: reliable delivery
#[derive(Debug, Error)]
pub enum Error {
    /// Bit I/O operation failed (e.g., reading past end of sequence)
    #[error("bit I/O error: {0}")]
    BitIo(#[from] BitIoError),

    /// Signal codec error (e.g., misaligned sample buffer)
    #[error("signal codec error: {0}")]
    Codec(#[from] CodecError),

    /// Channel coder flagged the received bits as unrecoverable
    #[error("channel coding error: {0}")]
    Coding(#[from] CodingError),

    /// Frame header or payload is malformed
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Fragment reassembly error
    #[error("reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),

    /// Switch could not forward a unit
    #[error("switch error: {0}")]
    Switch(#[from] SwitchError),

    /// Reliable transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Channel communication error (closed or full task queue)
    #[error("channel error: {0}")]
    Channel(String),
}

/// Bit-level I/O errors.
#[derive(Debug, Error)]
pub enum BitIoError {
    /// Attempted to read past the end of the bit sequence
    #[error("unexpected end of bit sequence")]
    UnexpectedEof,

    /// Invalid bit count (more than 64 bits in one field)
    #[error("invalid bit count: {0}")]
    InvalidBitCount(usize),
}

/// Signal codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Buffer length is not a whole number of bit periods.
    ///
    /// The codec trims to the largest exact multiple and hands back what it
    /// recovered from the trimmed buffer, so the caller can decide whether
    /// to use it.
    #[error("{samples} samples is not a multiple of {samples_per_bit} samples per bit")]
    MisalignedLength {
        samples: usize,
        samples_per_bit: usize,
        recovered: Vec<bool>,
    },

    /// Buffer was sampled at a different rate than the codec expects
    #[error("sample rate mismatch: expected {expected} Hz, got {actual} Hz")]
    SampleRateMismatch { expected: u32, actual: u32 },

    /// Codec parameters are unusable
    #[error("invalid codec parameters: {0}")]
    InvalidParams(String),
}

/// Channel coding errors.
#[derive(Debug, Error)]
pub enum CodingError {
    /// Error pattern exceeds what the active code can correct
    #[error("uncorrectable bit errors ({coded_bits} coded bits)")]
    Uncorrectable { coded_bits: usize },
}

/// Frame parsing errors.
#[derive(Debug, Error)]
pub enum FramingError {
    /// Bit sequence is too short to contain a header
    #[error("frame too short: need at least {required} bits, got {actual}")]
    FrameTooShort { required: usize, actual: usize },

    /// Length field disagrees with the number of payload bits present
    #[error("payload length mismatch: header says {expected} bits, got {actual}")]
    PayloadLengthMismatch { expected: usize, actual: usize },

    /// Unknown frame kind tag
    #[error("invalid frame kind: {0}")]
    InvalidKind(u8),

    /// Fragment index out of range for its fragment count
    #[error("fragment index {index} out of range for count {count}")]
    InvalidFragment { index: u8, count: u8 },

    /// Header parsed but the checksum does not match
    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        header: FrameHeader,
        expected: u16,
        actual: u16,
    },
}

/// Reassembly errors.
#[derive(Debug, Error)]
pub enum ReassemblyError {
    /// A newer message from the same source started before this one
    /// completed, so its missing fragments will never arrive
    #[error("message {message_id} from {source_addr} superseded (missing {missing} fragments)")]
    Superseded {
        source_addr: Address,
        message_id: u16,
        missing: usize,
    },

    /// Too many partial messages in flight
    #[error("reassembly window full: max {max} messages in flight")]
    WindowFull { max: usize },

    /// Same fragment received twice for a partial message
    #[error("duplicate fragment: message {message_id}, fragment {fragment_index}")]
    DuplicateFragment { message_id: u16, fragment_index: u8 },

    /// Fragments of one message disagree on the fragment count
    #[error("fragment count mismatch for message {message_id}: expected {expected}, got {actual}")]
    FragmentCountMismatch {
        message_id: u16,
        expected: u8,
        actual: u8,
    },
}

/// Switch forwarding errors.
#[derive(Debug, Error)]
pub enum SwitchError {
    /// No forwarding table entry for the destination address
    #[error("unknown destination {destination} (arrived on port {ingress})")]
    UnknownDestination { destination: Address, ingress: usize },

    /// Port index outside the switch
    #[error("invalid port {port}: switch has {ports} ports")]
    InvalidPort { port: usize, ports: usize },
}

/// Reliable transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Message abandoned after exhausting retransmissions
    #[error("delivery of message {message_id} to {peer} failed after {attempts} attempts")]
    DeliveryFailure {
        peer: Address,
        message_id: u16,
        attempts: u32,
    },

    /// Send window is full and the caller did not wait
    #[error("send window to {peer} is full ({window} frames)")]
    Capacity { peer: Address, window: usize },

    /// Session was closed before the message was delivered
    #[error("session with {peer} is closed")]
    SessionClosed { peer: Address },

    /// Message needs more fragments than the header can number
    #[error("message of {len} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },
}

/// Type alias for Result with our Error type
pub type Result<T> = std::result::Result<T, Error>;
