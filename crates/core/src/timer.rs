//! Retransmission timeout estimation and per-frame timers.
//!
//! RTO follows RFC 6298: `RTO = SRTT + 4 × RTTVAR`, doubled on every
//! timeout and clamped to `[min_rto, max_rto]`. RTT samples are only taken
//! from frames that were transmitted once (Karn's rule, enforced by the
//! caller).
//!
//! Timers are plain deadlines. The host task sleeps until the earliest one
//! and asks the transport which frames expired.

use std::time::Duration;
use tokio::time::Instant;

/// Timeout parameters for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// RTO before any RTT sample is available
    pub initial_rto: Duration,
    /// Lower clamp
    pub min_rto: Duration,
    /// Upper clamp after repeated back-off
    pub max_rto: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(200),
            min_rto: Duration::from_millis(20),
            max_rto: Duration::from_secs(5),
        }
    }
}

impl TimerConfig {
    fn clamp(&self, rto: Duration) -> Duration {
        rto.clamp(self.min_rto, self.max_rto)
    }
}

/// Smoothed round-trip estimator for one peer.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    config: TimerConfig,
    current_rto: Duration,
    srtt: Option<Duration>,
    rttvar: Duration,
}

impl RtoEstimator {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            current_rto: config.clamp(config.initial_rto),
            config,
            srtt: None,
            rttvar: Duration::ZERO,
        }
    }

    /// Fold in a new RTT measurement (RFC 6298 §2).
    ///
    /// First sample: `SRTT = R`, `RTTVAR = R/2`.
    /// Later samples: `RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|`, then
    /// `SRTT = 7/8·SRTT + 1/8·R`.
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = self.rttvar * 3 / 4 + diff / 4;
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
        }
        self.reset();
    }

    /// Double the RTO after a timeout (RFC 6298 §5.5).
    pub fn back_off(&mut self) {
        self.current_rto = self.config.clamp(self.current_rto.saturating_mul(2));
    }

    /// Recompute the RTO from the current estimates, undoing back-off.
    pub fn reset(&mut self) {
        self.current_rto = match self.srtt {
            Some(srtt) => self.config.clamp(srtt + self.rttvar * 4),
            None => self.config.clamp(self.config.initial_rto),
        };
    }

    pub fn rto(&self) -> Duration {
        self.current_rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }
}

/// A single retransmission deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetransmitTimer {
    deadline: Option<Instant>,
}

impl RetransmitTimer {
    /// Start (or restart) the timer to fire `rto` after `now`.
    pub fn arm(&mut self, now: Instant, rto: Duration) {
        self.deadline = Some(now + rto);
    }

    /// `true` once the deadline has passed. An unarmed timer never expires.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TimerConfig {
        TimerConfig {
            initial_rto: Duration::from_millis(100),
            min_rto: Duration::from_millis(10),
            max_rto: Duration::from_millis(800),
        }
    }

    #[test]
    fn initial_rto_before_samples() {
        let est = RtoEstimator::new(config());
        assert_eq!(est.rto(), Duration::from_millis(100));
        assert_eq!(est.srtt(), None);
    }

    #[test]
    fn first_sample_sets_srtt() {
        let mut est = RtoEstimator::new(config());
        est.record_rtt_sample(Duration::from_millis(40));
        assert_eq!(est.srtt(), Some(Duration::from_millis(40)));
        // 40 + 4 * 20
        assert_eq!(est.rto(), Duration::from_millis(120));
    }

    #[test]
    fn stable_samples_shrink_variance() {
        let mut est = RtoEstimator::new(config());
        for _ in 0..20 {
            est.record_rtt_sample(Duration::from_millis(40));
        }
        assert_eq!(est.srtt(), Some(Duration::from_millis(40)));
        assert!(est.rto() < Duration::from_millis(50));
    }

    #[test]
    fn back_off_doubles_and_clamps() {
        let mut est = RtoEstimator::new(config());
        est.back_off();
        assert_eq!(est.rto(), Duration::from_millis(200));
        for _ in 0..10 {
            est.back_off();
        }
        assert_eq!(est.rto(), Duration::from_millis(800));

        est.reset();
        assert_eq!(est.rto(), Duration::from_millis(100));
    }

    #[test]
    fn min_rto_clamp() {
        let mut est = RtoEstimator::new(config());
        est.record_rtt_sample(Duration::from_micros(10));
        assert_eq!(est.rto(), Duration::from_millis(10));
    }

    #[test]
    fn timer_arm_and_expire() {
        let now = Instant::now();
        let mut timer = RetransmitTimer::default();
        assert!(!timer.is_expired(now));

        timer.arm(now, Duration::from_millis(50));
        assert!(!timer.is_expired(now));
        assert!(timer.is_expired(now + Duration::from_millis(50)));
        assert_eq!(timer.deadline(), Some(now + Duration::from_millis(50)));

        // Re-arming moves the deadline
        timer.arm(now + Duration::from_millis(50), Duration::from_millis(50));
        assert!(!timer.is_expired(now + Duration::from_millis(60)));
    }
}
