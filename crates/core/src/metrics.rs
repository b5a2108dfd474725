//! Per-host counters and reporting.
//!
//! Tracks what one host stack saw and did:
//! - Frames on the wire (data, ACK, NACK, retransmissions)
//! - Channel damage (corrected, uncorrectable, framing errors)
//! - Message outcomes (sent, delivered, failed, received)
//!
//! # Thread Safety
//!
//! `HostMetrics` is a plain struct owned by one [`HostStack`]. Other tasks
//! get a copy through the host handle.
//!
//! [`HostStack`]: crate::host::HostStack

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Counters for one host.
#[derive(Debug, Clone)]
pub struct HostMetrics {
    /// When the host stack was created
    pub start_time: Instant,

    // === Transmit ===
    /// Data frames put on the wire, including retransmissions
    pub data_frames_sent: u64,

    /// Data frames re-sent after a timeout or NACK
    pub retransmissions: u64,

    /// ACK frames sent
    pub acks_sent: u64,

    /// NACK frames sent
    pub nacks_sent: u64,

    /// Units the link refused (queue full or closed)
    pub link_errors: u64,

    // === Receive ===
    /// Units that arrived on the link
    pub units_received: u64,

    /// Units parsed into a valid frame
    pub frames_received: u64,

    /// ACKs received
    pub acks_received: u64,

    /// NACKs received
    pub nacks_received: u64,

    /// Frames whose bit errors the channel code repaired
    pub corrected: u64,

    /// Units the channel code flagged as unrecoverable
    pub uncorrectable: u64,

    /// Units that failed to demodulate or parse
    pub framing_errors: u64,

    /// Valid frames addressed to another host
    pub misaddressed: u64,

    /// Data frames received again after delivery
    pub duplicates: u64,

    // === Messages ===
    /// Messages accepted by `send`
    pub messages_sent: u64,

    /// Messages acknowledged end to end
    pub messages_delivered: u64,

    /// Messages abandoned or cancelled
    pub messages_failed: u64,

    /// Messages reassembled and handed to the application
    pub messages_received: u64,

    /// Partial messages dropped because their sender moved on
    pub partial_messages_superseded: u64,

    /// Data frames left unacknowledged because reassembly had no room
    pub fragments_refused: u64,
}

impl HostMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            data_frames_sent: 0,
            retransmissions: 0,
            acks_sent: 0,
            nacks_sent: 0,
            link_errors: 0,
            units_received: 0,
            frames_received: 0,
            acks_received: 0,
            nacks_received: 0,
            corrected: 0,
            uncorrectable: 0,
            framing_errors: 0,
            misaddressed: 0,
            duplicates: 0,
            messages_sent: 0,
            messages_delivered: 0,
            messages_failed: 0,
            messages_received: 0,
            partial_messages_superseded: 0,
            fragments_refused: 0,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Share of data transmissions that were retransmissions.
    pub fn retransmission_rate(&self) -> f64 {
        if self.data_frames_sent == 0 {
            0.0
        } else {
            self.retransmissions as f64 / self.data_frames_sent as f64
        }
    }

    /// Share of received units that could not be used.
    pub fn error_rate(&self) -> f64 {
        if self.units_received == 0 {
            0.0
        } else {
            (self.uncorrectable + self.framing_errors) as f64 / self.units_received as f64
        }
    }

    /// Share of finished messages that were delivered.
    pub fn delivery_rate(&self) -> f64 {
        let finished = self.messages_delivered + self.messages_failed;
        if finished == 0 {
            0.0
        } else {
            self.messages_delivered as f64 / finished as f64
        }
    }

    /// Export metrics as `key=value` lines (for parsing/testing).
    pub fn export_text(&self) -> String {
        format!(
            "data_frames_sent={}\n\
             retransmissions={}\n\
             retransmission_rate={:.4}\n\
             acks_sent={}\n\
             nacks_sent={}\n\
             link_errors={}\n\
             units_received={}\n\
             frames_received={}\n\
             acks_received={}\n\
             nacks_received={}\n\
             corrected={}\n\
             uncorrectable={}\n\
             framing_errors={}\n\
             error_rate={:.4}\n\
             misaddressed={}\n\
             duplicates={}\n\
             messages_sent={}\n\
             messages_delivered={}\n\
             messages_failed={}\n\
             delivery_rate={:.4}\n\
             messages_received={}\n\
             partial_messages_superseded={}\n\
             fragments_refused={}\n",
            self.data_frames_sent,
            self.retransmissions,
            self.retransmission_rate(),
            self.acks_sent,
            self.nacks_sent,
            self.link_errors,
            self.units_received,
            self.frames_received,
            self.acks_received,
            self.nacks_received,
            self.corrected,
            self.uncorrectable,
            self.framing_errors,
            self.error_rate(),
            self.misaddressed,
            self.duplicates,
            self.messages_sent,
            self.messages_delivered,
            self.messages_failed,
            self.delivery_rate(),
            self.messages_received,
            self.partial_messages_superseded,
            self.fragments_refused,
        )
    }
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HostMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  frames:   {} data sent ({} retransmitted, {:.1}%), {} acks, {} nacks",
            self.data_frames_sent,
            self.retransmissions,
            self.retransmission_rate() * 100.0,
            self.acks_sent,
            self.nacks_sent
        )?;
        writeln!(
            f,
            "  received: {} units, {} frames, {} corrected, {} uncorrectable, {} malformed",
            self.units_received,
            self.frames_received,
            self.corrected,
            self.uncorrectable,
            self.framing_errors
        )?;
        write!(
            f,
            "  messages: {} sent, {} delivered, {} failed, {} received",
            self.messages_sent, self.messages_delivered, self.messages_failed, self.messages_received
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = HostMetrics::new();
        assert_eq!(metrics.data_frames_sent, 0);
        assert!(metrics.uptime() < Duration::from_secs(5));
    }

    #[test]
    fn test_rates_without_traffic() {
        let metrics = HostMetrics::new();
        assert_eq!(metrics.retransmission_rate(), 0.0);
        assert_eq!(metrics.error_rate(), 0.0);
        assert_eq!(metrics.delivery_rate(), 0.0);
    }

    #[test]
    fn test_rates() {
        let mut metrics = HostMetrics::new();
        metrics.data_frames_sent = 100;
        metrics.retransmissions = 5;
        metrics.units_received = 50;
        metrics.uncorrectable = 3;
        metrics.framing_errors = 2;
        metrics.messages_delivered = 3;
        metrics.messages_failed = 1;

        assert_eq!(metrics.retransmission_rate(), 0.05);
        assert_eq!(metrics.error_rate(), 0.1);
        assert_eq!(metrics.delivery_rate(), 0.75);
    }

    #[test]
    fn test_export_text() {
        let mut metrics = HostMetrics::new();
        metrics.messages_sent = 4;
        metrics.corrected = 7;

        let text = metrics.export_text();
        assert!(text.contains("messages_sent=4\n"));
        assert!(text.contains("corrected=7\n"));
        assert!(text.contains("retransmission_rate=0.0000\n"));
    }

    #[test]
    fn test_display() {
        let mut metrics = HostMetrics::new();
        metrics.messages_received = 2;
        assert!(metrics.to_string().contains("2 received"));
    }
}
