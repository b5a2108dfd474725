//! Frame ⇄ waveform pipeline shared by hosts and the switch.
//!
//! ```text
//! Frame ──serialize──▶ bits ──encode──▶ coded bits ──modulate──▶ samples
//! Frame ◀─deserialize─ bits ◀─decode─── coded bits ◀─demodulate─ samples
//! ```
//!
//! Both ends of every link must agree on the [`LinkCodec`].

use crate::coding::ChannelCoding;
use crate::error::{CodingError, Result};
use crate::frame::{peek_addresses, Address, Frame, ADDRESS_PREFIX_BITS};
use crate::signal::{CodecParams, Modulation, SampleBuffer, SignalCodec};

/// A frame recovered from a waveform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub frame: Frame,

    /// The channel code repaired at least one bit
    pub corrected: bool,
}

/// Signal codec plus channel coding.
#[derive(Debug, Clone)]
pub struct LinkCodec {
    signal: SignalCodec,
    coding: ChannelCoding,
}

impl LinkCodec {
    pub fn new(scheme: Modulation, params: CodecParams, coding: ChannelCoding) -> Result<Self> {
        Ok(Self {
            signal: SignalCodec::new(scheme, params)?,
            coding,
        })
    }

    pub fn signal(&self) -> &SignalCodec {
        &self.signal
    }

    pub fn coding(&self) -> ChannelCoding {
        self.coding
    }

    /// Serialize, code and modulate a frame.
    pub fn encode(&self, frame: &Frame) -> SampleBuffer {
        let coded = self.coding.encode(&frame.serialize());
        self.signal.modulate(&coded)
    }

    /// Demodulate, decode and parse a unit.
    ///
    /// # Errors
    /// - `CodecError` if the waveform cannot be demodulated
    /// - `CodingError::Uncorrectable` if the channel code flags the bits
    /// - `FramingError` if the recovered bits are not a valid frame
    pub fn decode(&self, unit: &SampleBuffer) -> Result<DecodedFrame> {
        let coded = self.signal.demodulate(unit)?;
        let decoded = self.coding.decode(&coded);
        if decoded.uncorrectable {
            return Err(CodingError::Uncorrectable {
                coded_bits: coded.len(),
            }
            .into());
        }

        let frame = Frame::deserialize(&decoded.bits)?;
        Ok(DecodedFrame {
            frame,
            corrected: decoded.corrected,
        })
    }

    /// Read only source and destination from a unit.
    ///
    /// Demodulates and decodes just enough coded bits for the address
    /// prefix. Returns `Ok(None)` if the unit is too short to hold one or the
    /// prefix itself is flagged uncorrectable.
    pub fn read_addresses(&self, unit: &SampleBuffer) -> Result<Option<(Address, Address)>> {
        let prefix = self.coding.prefix_len(ADDRESS_PREFIX_BITS);
        let Some(coded) = self.signal.demodulate_prefix(unit, prefix)? else {
            return Ok(None);
        };

        let decoded = self.coding.decode_prefix(&coded);
        if decoded.uncorrectable {
            return Ok(None);
        }
        Ok(peek_addresses(&decoded.bits))
    }
}
