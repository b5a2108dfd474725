//! Signal codec: bit sequences to sampled waveforms and back.
//!
//! Each bit occupies exactly `samples_per_bit` samples of a sinusoidal
//! carrier. Both ends agree on [`CodecParams`] in advance; nothing about the
//! waveform is negotiated on the wire.
//!
//! # Schemes
//!
//! | Scheme | bit 0              | bit 1            | decision                     |
//! |--------|--------------------|------------------|------------------------------|
//! | ASK    | silence            | carrier          | envelope vs amplitude / 2    |
//! | FSK    | carrier (space)    | mark tone        | mark envelope - space > 0    |
//! | PSK    | inverted carrier   | carrier          | carrier correlation > 0      |
//!
//! ASK and FSK demodulate non-coherently (I/Q envelope), PSK coherently.
//! All thresholds sit at the midpoint between the expected levels, so a
//! moderately attenuated signal still decodes.
//!
//! # Noise bound
//!
//! With default parameters and unit amplitude, additive Gaussian noise with
//! standard deviation up to 0.1 keeps the bit error rate below 1e-3 for all
//! three schemes (the per-bit correlation averages 48 samples).

use crate::bitio::Bits;
use crate::error::{CodecError, Result};
use std::f64::consts::TAU;

/// Sampled waveform tagged with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub samples: Vec<f64>,
    pub sample_rate: u32,
}

impl SampleBuffer {
    pub fn new(samples: Vec<f64>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// A buffer of `len` zero samples.
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0.0; len], sample_rate)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Modulation scheme, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Modulation {
    /// On/off amplitude keying
    #[default]
    Ask,
    /// Binary frequency keying
    Fsk,
    /// Binary phase keying
    Psk,
}

/// Waveform parameters agreed by both ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodecParams {
    /// Samples per second
    pub sample_rate: u32,

    /// Samples allocated to one bit
    pub samples_per_bit: usize,

    /// Carrier frequency (ASK/PSK carrier, FSK space tone)
    pub carrier_hz: f64,

    /// FSK mark tone (bit 1)
    pub mark_hz: f64,

    /// Peak amplitude of the transmitted carrier
    pub amplitude: f64,

    /// Amplitude gain the receiver expects from the path, 1.0 for a
    /// lossless one. Only ASK depends on it: its decision threshold sits at
    /// half the expected received amplitude.
    pub path_gain: f64,
}

impl Default for CodecParams {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            samples_per_bit: 48,
            carrier_hz: 2_000.0,
            mark_hz: 4_000.0,
            amplitude: 1.0,
            path_gain: 1.0,
        }
    }
}

impl CodecParams {
    /// Peak amplitude expected at the receiver.
    pub fn received_amplitude(&self) -> f64 {
        self.amplitude * self.path_gain
    }

    /// Same parameters, tuned for a path with the given amplitude gain.
    pub fn with_path_gain(mut self, path_gain: f64) -> Self {
        self.path_gain = path_gain;
        self
    }

    /// Check the parameters describe a usable waveform.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.samples_per_bit == 0 {
            return Err(CodecError::InvalidParams(
                "sample rate and samples per bit must be non-zero".to_string(),
            )
            .into());
        }
        if !(self.amplitude > 0.0) {
            return Err(CodecError::InvalidParams("amplitude must be positive".to_string()).into());
        }
        if !(self.path_gain > 0.0 && self.path_gain.is_finite()) {
            return Err(CodecError::InvalidParams("path gain must be positive".to_string()).into());
        }

        let nyquist = self.sample_rate as f64 / 2.0;
        for (name, hz) in [("carrier", self.carrier_hz), ("mark", self.mark_hz)] {
            if !(hz > 0.0 && hz < nyquist) {
                return Err(CodecError::InvalidParams(format!(
                    "{name} frequency {hz} Hz outside (0, {nyquist}) Hz"
                ))
                .into());
            }
        }
        if self.carrier_hz == self.mark_hz {
            return Err(CodecError::InvalidParams(
                "carrier and mark tones must differ".to_string(),
            )
            .into());
        }

        Ok(())
    }
}

/// In-phase and quadrature reference tones for one bit period.
#[derive(Debug, Clone)]
struct Basis {
    sin: Vec<f64>,
    cos: Vec<f64>,
}

impl Basis {
    fn new(hz: f64, params: &CodecParams) -> Self {
        let step = TAU * hz / params.sample_rate as f64;
        let (sin, cos) = (0..params.samples_per_bit)
            .map(|n| {
                let phase = step * n as f64;
                (phase.sin(), phase.cos())
            })
            .unzip();
        Self { sin, cos }
    }

    /// Correlation with the in-phase tone, scaled so a full tone yields its amplitude.
    fn in_phase(&self, segment: &[f64]) -> f64 {
        correlate(segment, &self.sin)
    }

    /// I/Q envelope, insensitive to carrier phase.
    fn envelope(&self, segment: &[f64]) -> f64 {
        correlate(segment, &self.sin).hypot(correlate(segment, &self.cos))
    }
}

fn correlate(segment: &[f64], reference: &[f64]) -> f64 {
    let sum: f64 = segment.iter().zip(reference).map(|(x, r)| x * r).sum();
    2.0 * sum / segment.len() as f64
}

/// Modulator/demodulator for one scheme and parameter set.
///
/// Never mutates the buffers it is given.
#[derive(Debug, Clone)]
pub struct SignalCodec {
    scheme: Modulation,
    params: CodecParams,
    carrier: Basis,
    mark: Basis,
}

impl SignalCodec {
    /// Build a codec, precomputing the reference tones.
    pub fn new(scheme: Modulation, params: CodecParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            scheme,
            params,
            carrier: Basis::new(params.carrier_hz, &params),
            mark: Basis::new(params.mark_hz, &params),
        })
    }

    pub fn scheme(&self) -> Modulation {
        self.scheme
    }

    pub fn params(&self) -> &CodecParams {
        &self.params
    }

    /// Number of samples produced for `bits` bits.
    pub fn samples_for(&self, bits: usize) -> usize {
        bits * self.params.samples_per_bit
    }

    /// Convert bits into a waveform.
    pub fn modulate(&self, bits: &[bool]) -> SampleBuffer {
        let a = self.params.amplitude;
        let mut samples = Vec::with_capacity(self.samples_for(bits.len()));

        for &bit in bits {
            match (self.scheme, bit) {
                (Modulation::Ask, true) => samples.extend(self.carrier.sin.iter().map(|s| a * s)),
                (Modulation::Ask, false) => {
                    samples.extend(std::iter::repeat(0.0).take(self.params.samples_per_bit))
                }
                (Modulation::Fsk, true) => samples.extend(self.mark.sin.iter().map(|s| a * s)),
                (Modulation::Fsk, false) => samples.extend(self.carrier.sin.iter().map(|s| a * s)),
                (Modulation::Psk, true) => samples.extend(self.carrier.sin.iter().map(|s| a * s)),
                (Modulation::Psk, false) => samples.extend(self.carrier.sin.iter().map(|s| -a * s)),
            }
        }

        SampleBuffer::new(samples, self.params.sample_rate)
    }

    /// Recover bits from a waveform.
    ///
    /// # Errors
    /// - `CodecError::SampleRateMismatch` if the buffer is tagged with another rate
    /// - `CodecError::MisalignedLength` if the length is not a whole number of
    ///   bit periods; the error carries the bits decoded from the trimmed buffer
    pub fn demodulate(&self, signal: &SampleBuffer) -> Result<Bits> {
        self.check_rate(signal)?;

        let spb = self.params.samples_per_bit;
        let whole = signal.len() / spb;
        let bits = self.decide_all(&signal.samples[..whole * spb]);

        if signal.len() % spb != 0 {
            return Err(CodecError::MisalignedLength {
                samples: signal.len(),
                samples_per_bit: spb,
                recovered: bits,
            }
            .into());
        }

        Ok(bits)
    }

    /// Recover only the first `bit_count` bits.
    ///
    /// Returns `None` if the buffer holds fewer than `bit_count` bit periods.
    pub fn demodulate_prefix(&self, signal: &SampleBuffer, bit_count: usize) -> Result<Option<Bits>> {
        self.check_rate(signal)?;

        let needed = self.samples_for(bit_count);
        if signal.len() < needed {
            return Ok(None);
        }
        Ok(Some(self.decide_all(&signal.samples[..needed])))
    }

    fn check_rate(&self, signal: &SampleBuffer) -> Result<()> {
        if signal.sample_rate != self.params.sample_rate {
            return Err(CodecError::SampleRateMismatch {
                expected: self.params.sample_rate,
                actual: signal.sample_rate,
            }
            .into());
        }
        Ok(())
    }

    fn decide_all(&self, samples: &[f64]) -> Bits {
        samples
            .chunks_exact(self.params.samples_per_bit)
            .map(|segment| self.decide(segment))
            .collect()
    }

    /// Threshold decision for one bit period.
    fn decide(&self, segment: &[f64]) -> bool {
        match self.scheme {
            Modulation::Ask => {
                self.carrier.envelope(segment) > self.params.received_amplitude() / 2.0
            }
            Modulation::Fsk => self.mark.envelope(segment) - self.carrier.envelope(segment) > 0.0,
            Modulation::Psk => self.carrier.in_phase(segment) > 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitio::{bytes_to_bits, count_bit_errors};
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const SCHEMES: [Modulation; 3] = [Modulation::Ask, Modulation::Fsk, Modulation::Psk];

    fn codec(scheme: Modulation) -> SignalCodec {
        SignalCodec::new(scheme, CodecParams::default()).unwrap()
    }

    /// Box-Muller noise, kept local so tests don't depend on the cable model.
    fn add_noise(signal: &SampleBuffer, std_dev: f64, seed: u64) -> SampleBuffer {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let samples = signal
            .samples
            .iter()
            .map(|s| {
                let u1: f64 = 1.0 - rng.gen::<f64>();
                let u2: f64 = rng.gen();
                s + std_dev * (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
            })
            .collect();
        SampleBuffer::new(samples, signal.sample_rate)
    }

    fn ber(scheme: Modulation, bits: &[bool], noise: f64) -> f64 {
        let codec = codec(scheme);
        let received = add_noise(&codec.modulate(bits), noise, 7);
        let decoded = codec.demodulate(&received).unwrap();
        count_bit_errors(bits, &decoded) as f64 / bits.len() as f64
    }

    #[test]
    fn test_modulated_length() {
        for scheme in SCHEMES {
            let signal = codec(scheme).modulate(&[true, false, true]);
            assert_eq!(signal.len(), 3 * 48);
            assert_eq!(signal.sample_rate, 48_000);
        }
    }

    #[test]
    fn test_ask_zero_is_silence() {
        let signal = codec(Modulation::Ask).modulate(&[false, false]);
        assert!(signal.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_round_trip_text() {
        let bits = bytes_to_bits(b"HI");
        for scheme in SCHEMES {
            let codec = codec(scheme);
            assert_eq!(codec.demodulate(&codec.modulate(&bits)).unwrap(), bits);
        }
    }

    #[test]
    fn test_attenuated_signal_still_decodes() {
        let bits = bytes_to_bits(b"attenuated");
        for scheme in SCHEMES {
            let codec = codec(scheme);
            let mut signal = codec.modulate(&bits);
            for s in signal.samples.iter_mut() {
                *s *= 0.9;
            }
            assert_eq!(codec.demodulate(&signal).unwrap(), bits);
        }
    }

    #[test]
    fn test_ask_threshold_follows_path_gain() {
        let bits = bytes_to_bits(b"two hops");
        let tx = codec(Modulation::Ask);
        let mut signal = tx.modulate(&bits);
        // Two cable hops at 0.3 each leave 0.09 of the amplitude
        for s in signal.samples.iter_mut() {
            *s *= 0.09;
        }

        let untuned = tx.demodulate(&signal).unwrap();
        assert!(untuned.iter().all(|bit| !bit));

        let rx = SignalCodec::new(Modulation::Ask, CodecParams::default().with_path_gain(0.09)).unwrap();
        assert_eq!(rx.demodulate(&signal).unwrap(), bits);
    }

    #[test]
    fn test_misaligned_length_trims_and_reports() {
        let codec = codec(Modulation::Psk);
        let bits = vec![true, false, true];
        let mut signal = codec.modulate(&bits);
        signal.samples.extend([0.1; 10]);

        match codec.demodulate(&signal) {
            Err(crate::error::Error::Codec(CodecError::MisalignedLength {
                samples,
                samples_per_bit,
                recovered,
            })) => {
                assert_eq!(samples, 3 * 48 + 10);
                assert_eq!(samples_per_bit, 48);
                assert_eq!(recovered, bits);
            }
            other => panic!("expected misaligned length, got {other:?}"),
        }
    }

    #[test]
    fn test_sample_rate_mismatch() {
        let codec = codec(Modulation::Ask);
        let signal = SampleBuffer::silence(48, 44_100);
        assert!(matches!(
            codec.demodulate(&signal),
            Err(crate::error::Error::Codec(CodecError::SampleRateMismatch { .. }))
        ));
    }

    #[test]
    fn test_demodulate_does_not_mutate_input() {
        let codec = codec(Modulation::Fsk);
        let signal = codec.modulate(&[true, false, false, true]);
        let before = signal.clone();
        codec.demodulate(&signal).unwrap();
        assert_eq!(signal, before);
    }

    #[test]
    fn test_demodulate_prefix() {
        let codec = codec(Modulation::Ask);
        let bits = bytes_to_bits(&[0xA5, 0x3C]);
        let signal = codec.modulate(&bits);

        let prefix = codec.demodulate_prefix(&signal, 8).unwrap().unwrap();
        assert_eq!(prefix, bits[..8].to_vec());
        assert!(codec.demodulate_prefix(&signal, 17).unwrap().is_none());
    }

    #[test]
    fn test_invalid_params() {
        let params = CodecParams {
            carrier_hz: 30_000.0,
            ..CodecParams::default()
        };
        assert!(SignalCodec::new(Modulation::Ask, params).is_err());

        let params = CodecParams {
            samples_per_bit: 0,
            ..CodecParams::default()
        };
        assert!(SignalCodec::new(Modulation::Psk, params).is_err());

        let params = CodecParams::default().with_path_gain(0.0);
        assert!(SignalCodec::new(Modulation::Ask, params).is_err());
    }

    #[test]
    fn test_low_noise_bound() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let bits: Vec<bool> = (0..4000).map(|_| rng.gen()).collect();
        for scheme in SCHEMES {
            assert!(ber(scheme, &bits, 0.1) < 1e-3, "{scheme:?} exceeded noise bound");
        }
    }

    #[test]
    fn test_ber_grows_with_noise() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let bits: Vec<bool> = (0..4000).map(|_| rng.gen()).collect();

        for scheme in SCHEMES {
            let rates: Vec<f64> = [0.0, 1.0, 2.0, 4.0]
                .iter()
                .map(|&noise| ber(scheme, &bits, noise))
                .collect();
            assert_eq!(rates[0], 0.0);
            for pair in rates.windows(2) {
                assert!(pair[0] <= pair[1], "{scheme:?}: {rates:?}");
            }
            assert!(rates[3] > 0.0);
        }
    }

    proptest! {
        #[test]
        fn prop_noiseless_round_trip(bits in proptest::collection::vec(any::<bool>(), 0..256)) {
            for scheme in SCHEMES {
                let codec = codec(scheme);
                prop_assert_eq!(codec.demodulate(&codec.modulate(&bits)).unwrap(), bits.clone());
            }
        }
    }
}
