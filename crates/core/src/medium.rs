//! Physical medium simulation and the async link adapter.
//!
//! A [`Channel`] turns a transmitted waveform into the waveform that arrives
//! at the far end. [`Cable`] is the reference channel:
//!
//! - **Attenuation**: every sample is scaled by `exp(-attenuation · length / 100)`
//! - **Noise**: additive white Gaussian noise with std `noise_level`
//! - **Erasure**: with probability `loss_rate` the whole transmission is
//!   replaced by silence of the same length
//! - **Propagation delay**: `length / signal_speed`
//!
//! [`MediumAdapter`] puts a channel behind a bounded queue and a delay-line
//! task so hosts and switch ports can exchange units concurrently.
//!
//! # Determinism
//!
//! All randomness comes from a ChaCha8 RNG seeded from [`CableConfig::seed`].
//! Given the same seed and the same sequence of transmissions, outputs are
//! bit-identical.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::signal::SampleBuffer;

/// Signal propagation speed in copper, metres per second.
pub const DEFAULT_SIGNAL_SPEED: f64 = 2e8;

/// Anything that can carry a waveform from one end to the other.
pub trait Channel: Send + 'static {
    /// Produce the waveform the receiver sees.
    fn transmit(&mut self, signal: &SampleBuffer) -> SampleBuffer;

    /// Time between a sample leaving and arriving.
    fn propagation_delay(&self) -> Duration;

    /// Amplitude multiplier applied to a unit that gets through.
    fn gain(&self) -> f64 {
        1.0
    }
}

impl Channel for Box<dyn Channel> {
    fn transmit(&mut self, signal: &SampleBuffer) -> SampleBuffer {
        (**self).transmit(signal)
    }

    fn propagation_delay(&self) -> Duration {
        (**self).propagation_delay()
    }

    fn gain(&self) -> f64 {
        (**self).gain()
    }
}

/// Configuration for a simulated cable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CableConfig {
    /// Cable length in metres
    pub length_m: f64,

    /// Attenuation per 100 m (natural log units)
    pub attenuation: f64,

    /// Standard deviation of the additive Gaussian noise
    pub noise_level: f64,

    /// Probability [0.0, 1.0] that a whole transmission is erased
    pub loss_rate: f64,

    /// Propagation speed in metres per second
    pub signal_speed: f64,

    /// Random seed for determinism
    pub seed: u64,
}

impl CableConfig {
    /// A lossless, noiseless, zero-length cable.
    pub fn ideal(seed: u64) -> Self {
        Self {
            length_m: 0.0,
            attenuation: 0.0,
            noise_level: 0.0,
            loss_rate: 0.0,
            signal_speed: DEFAULT_SIGNAL_SPEED,
            seed,
        }
    }

    /// 100 m of cable with mild attenuation and noise.
    pub fn default_with_seed(seed: u64) -> Self {
        Self {
            length_m: 100.0,
            attenuation: 0.1,
            noise_level: 0.01,
            loss_rate: 0.0,
            signal_speed: DEFAULT_SIGNAL_SPEED,
            seed,
        }
    }

    /// Same cable, different RNG stream.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Amplitude multiplier applied end to end.
    pub fn attenuation_factor(&self) -> f64 {
        (-self.attenuation * self.length_m / 100.0).exp()
    }

    pub fn propagation_delay(&self) -> Duration {
        if self.signal_speed <= 0.0 || self.length_m <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.length_m / self.signal_speed)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.loss_rate) {
            return Err(Error::Config(format!(
                "loss_rate must be within [0, 1], got {}",
                self.loss_rate
            )));
        }
        if self.noise_level < 0.0 || self.attenuation < 0.0 || self.length_m < 0.0 {
            return Err(Error::Config(
                "cable length, attenuation and noise must be non-negative".into(),
            ));
        }
        if self.signal_speed <= 0.0 {
            return Err(Error::Config("signal_speed must be positive".into()));
        }
        Ok(())
    }
}

/// Reference channel: attenuation, Gaussian noise, erasures and delay.
pub struct Cable {
    config: CableConfig,
    rng: ChaCha8Rng,
    transmissions: u64,
    erasures: u64,
}

impl Cable {
    pub fn new(config: CableConfig) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            transmissions: 0,
            erasures: 0,
        }
    }

    pub fn config(&self) -> &CableConfig {
        &self.config
    }

    pub fn stats(&self) -> CableStats {
        CableStats {
            transmissions: self.transmissions,
            erasures: self.erasures,
        }
    }

    /// One sample of N(0, 1) via Box-Muller.
    fn gaussian(&mut self) -> f64 {
        // 1 - U keeps the argument of ln strictly positive
        let u1: f64 = 1.0 - self.rng.gen::<f64>();
        let u2: f64 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
    }
}

impl Channel for Cable {
    fn transmit(&mut self, signal: &SampleBuffer) -> SampleBuffer {
        self.transmissions += 1;

        if self.config.loss_rate > 0.0 {
            let roll: f64 = self.rng.gen();
            if roll < self.config.loss_rate {
                self.erasures += 1;
                return SampleBuffer::silence(signal.len(), signal.sample_rate);
            }
        }

        let gain = self.config.attenuation_factor();
        let noise = self.config.noise_level;
        let samples = if noise > 0.0 {
            signal
                .samples
                .iter()
                .map(|s| s * gain + noise * self.gaussian())
                .collect()
        } else {
            signal.samples.iter().map(|s| s * gain).collect()
        };

        SampleBuffer::new(samples, signal.sample_rate)
    }

    fn propagation_delay(&self) -> Duration {
        self.config.propagation_delay()
    }

    fn gain(&self) -> f64 {
        self.config.attenuation_factor()
    }
}

/// Counters for one cable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CableStats {
    pub transmissions: u64,
    pub erasures: u64,
}

impl CableStats {
    pub fn erasure_rate(&self) -> f64 {
        if self.transmissions == 0 {
            0.0
        } else {
            self.erasures as f64 / self.transmissions as f64
        }
    }
}

#[derive(Debug, Default)]
struct LinkCounters {
    sent: AtomicU64,
    delivered: AtomicU64,
    rejected: AtomicU64,
}

/// Snapshot of one link's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Units accepted into the link
    pub sent: u64,
    /// Units handed to the receiver
    pub delivered: u64,
    /// Units refused because the queue was full or closed
    pub rejected: u64,
}

/// Sending end of a link. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LinkSender {
    tx: mpsc::Sender<(Instant, SampleBuffer)>,
    delay: Duration,
    counters: Arc<LinkCounters>,
}

impl LinkSender {
    /// Queue a unit for transmission without waiting.
    ///
    /// Returns the propagation delay the unit will experience.
    ///
    /// # Errors
    /// `Error::Channel` if the link queue is full or the link has shut down.
    pub fn send(&self, samples: SampleBuffer) -> Result<Duration> {
        match self.tx.try_send((Instant::now(), samples)) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                Ok(self.delay)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(Error::Channel("link queue is full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(Error::Channel("link is closed".into()))
            }
        }
    }

    pub fn propagation_delay(&self) -> Duration {
        self.delay
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Receiving end of a link.
#[derive(Debug)]
pub struct LinkReceiver {
    rx: mpsc::Receiver<SampleBuffer>,
}

impl LinkReceiver {
    /// Wait for the next unit. `None` once the link has shut down.
    pub async fn receive(&mut self) -> Option<SampleBuffer> {
        self.rx.recv().await
    }
}

/// Spawns the delay-line task that drives a [`Channel`].
pub struct MediumAdapter;

impl MediumAdapter {
    /// Put `channel` behind a queue of `capacity` units.
    ///
    /// Each unit is passed through the channel and released to the
    /// receiver once its propagation delay has elapsed. Units arrive in the
    /// order they were sent. The task exits when `cancel` fires or every
    /// [`LinkSender`] is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<C: Channel>(
        mut channel: C,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (LinkSender, LinkReceiver) {
        let capacity = capacity.max(1);
        let delay = channel.propagation_delay();
        let (in_tx, mut in_rx) = mpsc::channel::<(Instant, SampleBuffer)>(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let counters = Arc::new(LinkCounters::default());
        let task_counters = Arc::clone(&counters);

        tokio::spawn(async move {
            loop {
                let (sent_at, samples) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    unit = in_rx.recv() => match unit {
                        Some(unit) => unit,
                        None => break,
                    },
                };

                let received = channel.transmit(&samples);
                trace!(samples = received.len(), ?delay, "unit on the wire");

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(sent_at + delay) => {}
                }

                if out_tx.send(received).await.is_err() {
                    break;
                }
                task_counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            debug!("link task stopped");
        });

        (
            LinkSender {
                tx: in_tx,
                delay,
                counters,
            },
            LinkReceiver { rx: out_rx },
        )
    }
}
