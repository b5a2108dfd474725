//! Selective-repeat reliable transport.
//!
//! A [`Session`] holds the send and receive state for one peer. Each data
//! frame carries an 8-bit sequence number and is acknowledged individually.
//!
//! # Protocol contract
//!
//! - At most `window_size` frames may be in flight at once, and their
//!   sequence numbers span less than `window_size` (at most 128, half the
//!   sequence space, so old and new numbers never alias).
//! - ACKs are **selective**: an ACK for `seq` covers only that frame.
//! - On timeout the expired frame alone is re-sent, unchanged. After
//!   `max_retries` timeouts its whole message is abandoned and the
//!   remaining fragments leave the window. A NACK re-sends at once but
//!   does not count as a retry.
//! - Every data frame carries `window_base`, the sender's oldest
//!   unacknowledged sequence number. Numbers below it will never be sent
//!   again, so the receiver may skip gaps left by abandoned messages.
//! - The receiver buffers frames inside its window, releases them in
//!   sequence order, and re-ACKs duplicates without releasing them again.
//!
//! ```text
//!  send_base              next_seq
//!      │                      │
//!  ────┼──────────────────────┼─────────────────▶ seq space (mod 256)
//!      │ <──── in flight ───▶ │ <── backlog ───▶
//! ```
//!
//! This module only manages state; all link I/O is the caller's
//! responsibility.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result, TransportError};
use crate::frame::{segment, Address, Frame, FrameHeader, FrameKind};
use crate::timer::{RetransmitTimer, RtoEstimator, TimerConfig};

/// Largest usable window: half the 8-bit sequence space.
pub const MAX_WINDOW: usize = 128;

/// Returns `b - a` in sequence space.
#[inline]
fn seq_offset(a: u8, b: u8) -> usize {
    b.wrapping_sub(a) as usize
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing in flight
    Idle,
    /// Frames in flight, window not full
    Sending,
    /// Window full; new frames wait for an ACK to free a slot
    WaitingAck,
    /// Terminal
    Closed,
}

/// Reliable transport settings. Both peers must agree on `window_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub window_size: usize,
    /// Timeouts per frame before its message is abandoned
    pub max_retries: u32,
    /// Payload bytes per frame
    pub max_payload: usize,
    pub timer: TimerConfig,
    /// Answer damaged data frames with a NACK
    pub nack: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            window_size: 8,
            max_retries: 5,
            max_payload: 32,
            timer: TimerConfig::default(),
            nack: true,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 || self.window_size > MAX_WINDOW {
            return Err(Error::Config(format!(
                "window_size must be within 1..={MAX_WINDOW}, got {}",
                self.window_size
            )));
        }
        if self.max_payload == 0 || self.max_payload > u16::MAX as usize {
            return Err(Error::Config(format!(
                "max_payload must be within 1..={}, got {}",
                u16::MAX,
                self.max_payload
            )));
        }
        let timer = &self.timer;
        if timer.min_rto.is_zero() || timer.min_rto > timer.max_rto {
            return Err(Error::Config(
                "retransmission timeouts need 0 < min_rto <= max_rto".into(),
            ));
        }
        Ok(())
    }

    /// Raise the timeouts so no timer fires before a round trip over a
    /// link with the given one-way delay can complete.
    pub fn with_propagation_delay(mut self, delay: Duration) -> Self {
        let floor = delay.saturating_mul(2);
        let timer = &mut self.timer;
        timer.min_rto = timer.min_rto.max(floor);
        timer.initial_rto = timer.initial_rto.max(timer.min_rto);
        timer.max_rto = timer.max_rto.max(timer.initial_rto);
        self
    }
}

/// Something the application should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Every fragment of the message was acknowledged
    Delivered { peer: Address, message_id: u16 },
    /// The message was abandoned
    Failed {
        peer: Address,
        message_id: u16,
        error: TransportError,
    },
}

/// Frames to transmit and events to report after a session step.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SessionOutput {
    pub frames: Vec<Frame>,
    pub events: Vec<TransportEvent>,
    /// How many of `frames` are retransmissions
    pub retransmissions: u64,
}

/// Result of receiving a data frame.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DataOutcome {
    /// Acknowledgement to send back, if the frame was acceptable
    pub ack: Option<Frame>,
    /// Data frames released in sequence order
    pub delivered: Vec<Frame>,
    /// The frame had already been received
    pub duplicate: bool,
}

/// One transmitted, unacknowledged frame.
#[derive(Debug, Clone)]
struct InFlight {
    frame: Frame,
    timer: RetransmitTimer,
    /// Total transmissions so far
    tx_count: u32,
    /// Timer-driven retransmissions, counted against `max_retries`
    retries: u32,
    /// Most recent transmission (for RTT sampling)
    sent_at: Instant,
}

/// A fragment waiting for a sequence number.
#[derive(Debug, Clone)]
struct Pending {
    message_id: u16,
    fragment_index: u8,
    fragment_count: u8,
    payload: Vec<u8>,
}

/// Transport state for one peer.
#[derive(Debug)]
pub struct Session {
    local: Address,
    peer: Address,
    config: TransportConfig,
    rto: RtoEstimator,
    closed: bool,

    /// Oldest unacknowledged sequence number (left window edge)
    send_base: u8,
    /// Sequence number for the next admitted fragment
    next_seq: u8,
    in_flight: HashMap<u8, InFlight>,
    backlog: VecDeque<Pending>,
    next_message_id: u16,
    /// Unacknowledged fragment count per message
    messages: HashMap<u16, usize>,

    /// Next sequence number to release to the application
    recv_base: u8,
    recv_buffer: HashMap<u8, Frame>,
}

impl Session {
    pub fn new(local: Address, peer: Address, config: TransportConfig) -> Self {
        Self {
            local,
            peer,
            rto: RtoEstimator::new(config.timer),
            config,
            closed: false,
            send_base: 0,
            next_seq: 0,
            in_flight: HashMap::new(),
            backlog: VecDeque::new(),
            next_message_id: 0,
            messages: HashMap::new(),
            recv_base: 0,
            recv_buffer: HashMap::new(),
        }
    }

    pub fn peer(&self) -> Address {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if self.in_flight.is_empty() && self.backlog.is_empty() {
            SessionState::Idle
        } else if !self.backlog.is_empty() || !self.window_open() {
            SessionState::WaitingAck
        } else {
            SessionState::Sending
        }
    }

    /// Whether a new message would be accepted right now.
    pub fn has_window_room(&self) -> bool {
        !self.closed && self.in_flight.len() + self.backlog.len() < self.config.window_size
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    pub fn rto(&self) -> Duration {
        self.rto.rto()
    }

    /// Queue a message, returning its id and the frames to transmit now.
    ///
    /// Fragments that do not fit in the window stay in the backlog and go
    /// out as ACKs free slots.
    ///
    /// # Errors
    /// - `TransportError::SessionClosed` after [`close`](Self::close)
    /// - `TransportError::Capacity` if the window has no room
    /// - `TransportError::MessageTooLarge` if the message needs more than
    ///   255 fragments
    pub fn send(&mut self, data: &[u8], now: Instant) -> Result<(u16, Vec<Frame>)> {
        if self.closed {
            return Err(TransportError::SessionClosed { peer: self.peer }.into());
        }
        if !self.has_window_room() {
            return Err(TransportError::Capacity {
                peer: self.peer,
                window: self.config.window_size,
            }
            .into());
        }

        let fragments = segment(data, self.config.max_payload)?;
        let fragment_count = fragments.len() as u8;
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.messages.insert(message_id, fragments.len());

        for (index, payload) in fragments.into_iter().enumerate() {
            self.backlog.push_back(Pending {
                message_id,
                fragment_index: index as u8,
                fragment_count,
                payload,
            });
        }

        trace!(peer = %self.peer, message_id, fragments = fragment_count, "message queued");
        Ok((message_id, self.admit(now)))
    }

    /// Process an ACK from the peer.
    pub fn on_ack(&mut self, sequence: u8, now: Instant) -> SessionOutput {
        let mut output = SessionOutput::default();
        if self.closed {
            return output;
        }

        let Some(entry) = self.in_flight.remove(&sequence) else {
            trace!(peer = %self.peer, sequence, "stale ack");
            return output;
        };

        // Karn's rule: an ACK for a retransmitted frame is ambiguous
        if entry.tx_count == 1 {
            self.rto
                .record_rtt_sample(now.saturating_duration_since(entry.sent_at));
        } else {
            self.rto.reset();
        }

        let message_id = entry.frame.header.message_id;
        if let Some(remaining) = self.messages.get_mut(&message_id) {
            *remaining -= 1;
            if *remaining == 0 {
                self.messages.remove(&message_id);
                debug!(peer = %self.peer, message_id, "message delivered");
                output.events.push(TransportEvent::Delivered {
                    peer: self.peer,
                    message_id,
                });
            }
        }

        self.advance_send_base();
        output.frames = self.admit(now);
        output
    }

    /// Process a NACK: re-send the frame at once instead of waiting for
    /// its timer.
    ///
    /// The sequence number may have been read from a damaged header, so a
    /// NACK only adds a copy. It neither re-arms the timer nor uses up a
    /// retry; abandonment is left to timeouts.
    pub fn on_nack(&mut self, sequence: u8, now: Instant) -> SessionOutput {
        let mut output = SessionOutput::default();
        if self.closed {
            return output;
        }
        let Some(entry) = self.in_flight.get_mut(&sequence) else {
            trace!(peer = %self.peer, sequence, "nack for a frame not in flight");
            return output;
        };

        entry.tx_count += 1;
        entry.sent_at = now;
        debug!(peer = %self.peer, sequence, attempt = entry.tx_count, "resending after nack");
        output.frames.push(entry.frame.clone());
        output.retransmissions += 1;
        output
    }

    /// Whether a data frame with this header would be newly buffered by
    /// [`on_data`](Self::on_data), as opposed to dropped or re-acknowledged
    /// as a duplicate.
    pub fn is_new_data(&self, header: &FrameHeader) -> bool {
        if self.closed {
            return false;
        }
        let skip = seq_offset(self.recv_base, header.window_base);
        let base = if skip > 0 && skip < MAX_WINDOW {
            header.window_base
        } else {
            self.recv_base
        };
        seq_offset(base, header.sequence) < self.config.window_size
            && !self.recv_buffer.contains_key(&header.sequence)
    }

    /// Process a data frame from the peer.
    pub fn on_data(&mut self, frame: Frame) -> DataOutcome {
        let mut outcome = DataOutcome::default();
        if self.closed {
            return outcome;
        }

        let header = frame.header;
        let window = self.config.window_size;

        // The sender will never resend anything below its window base
        let skip = seq_offset(self.recv_base, header.window_base);
        if skip > 0 && skip < MAX_WINDOW {
            trace!(peer = %self.peer, from = self.recv_base, to = header.window_base, "receive window skip");
            for _ in 0..skip {
                if let Some(buffered) = self.recv_buffer.remove(&self.recv_base) {
                    outcome.delivered.push(buffered);
                }
                self.recv_base = self.recv_base.wrapping_add(1);
            }
        }

        let ahead = seq_offset(self.recv_base, header.sequence);
        let behind = seq_offset(header.sequence, self.recv_base);
        if ahead < window {
            outcome.ack = Some(self.ack_for(&frame));
            outcome.duplicate = self.recv_buffer.contains_key(&header.sequence);
            self.recv_buffer.entry(header.sequence).or_insert(frame);
            while let Some(next) = self.recv_buffer.remove(&self.recv_base) {
                outcome.delivered.push(next);
                self.recv_base = self.recv_base.wrapping_add(1);
            }
        } else if behind > 0 && behind <= MAX_WINDOW {
            trace!(peer = %self.peer, sequence = header.sequence, "duplicate data frame");
            outcome.ack = Some(self.ack_for(&frame));
            outcome.duplicate = true;
        } else {
            warn!(peer = %self.peer, sequence = header.sequence, base = self.recv_base, "data frame outside window");
        }

        outcome
    }

    /// Retransmit expired frames, abandoning messages that ran out of retries.
    pub fn poll_timers(&mut self, now: Instant) -> SessionOutput {
        let mut output = SessionOutput::default();
        if self.closed {
            return output;
        }

        let mut expired: Vec<u8> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.timer.is_expired(now))
            .map(|(seq, _)| *seq)
            .collect();
        if expired.is_empty() {
            return output;
        }
        expired.sort_by_key(|seq| seq_offset(self.send_base, *seq));

        self.rto.back_off();
        for seq in expired {
            // An earlier abandonment may already have removed it
            if self.in_flight.contains_key(&seq) {
                self.retransmit_or_abandon(seq, now, &mut output);
            }
        }
        output
    }

    /// Earliest retransmission deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight
            .values()
            .filter_map(|entry| entry.timer.deadline())
            .min()
    }

    /// Close the session for good, failing every pending message.
    pub fn close(&mut self) -> Vec<TransportEvent> {
        let events = self.fail_pending();
        self.closed = true;
        self.recv_buffer.clear();
        debug!(peer = %self.peer, "session closed");
        events
    }

    /// Abort pending messages but keep the session usable.
    ///
    /// Sequence numbering continues where it left off, so the peer's
    /// receive state stays valid.
    pub fn reset(&mut self) -> Vec<TransportEvent> {
        if self.closed {
            return Vec::new();
        }
        let events = self.fail_pending();
        self.send_base = self.next_seq;
        self.rto.reset();
        debug!(peer = %self.peer, "session reset");
        events
    }

    fn fail_pending(&mut self) -> Vec<TransportEvent> {
        let mut ids: Vec<u16> = self.messages.drain().map(|(id, _)| id).collect();
        ids.sort_unstable();
        self.in_flight.clear();
        self.backlog.clear();

        ids.into_iter()
            .map(|message_id| TransportEvent::Failed {
                peer: self.peer,
                message_id,
                error: TransportError::SessionClosed { peer: self.peer },
            })
            .collect()
    }

    fn ack_for(&self, frame: &Frame) -> Frame {
        Frame::ack(
            self.local,
            self.peer,
            frame.header.sequence,
            frame.header.message_id,
        )
    }

    fn window_open(&self) -> bool {
        seq_offset(self.send_base, self.next_seq) < self.config.window_size
    }

    /// Move fragments from the backlog into the window.
    fn admit(&mut self, now: Instant) -> Vec<Frame> {
        let mut frames = Vec::new();
        while self.window_open() {
            let Some(pending) = self.backlog.pop_front() else {
                break;
            };

            let frame = Frame::data(
                self.local,
                self.peer,
                self.next_seq,
                self.send_base,
                pending.message_id,
                pending.fragment_index,
                pending.fragment_count,
                pending.payload,
            );
            let mut timer = RetransmitTimer::default();
            timer.arm(now, self.rto.rto());
            self.in_flight.insert(
                self.next_seq,
                InFlight {
                    frame: frame.clone(),
                    timer,
                    tx_count: 1,
                    retries: 0,
                    sent_at: now,
                },
            );
            self.next_seq = self.next_seq.wrapping_add(1);
            frames.push(frame);
        }
        frames
    }

    fn advance_send_base(&mut self) {
        while self.send_base != self.next_seq && !self.in_flight.contains_key(&self.send_base) {
            self.send_base = self.send_base.wrapping_add(1);
        }
    }

    fn retransmit_or_abandon(&mut self, seq: u8, now: Instant, output: &mut SessionOutput) {
        let rto = self.rto.rto();
        let max_retries = self.config.max_retries;
        let Some(entry) = self.in_flight.get_mut(&seq) else {
            return;
        };

        if entry.retries >= max_retries {
            let message_id = entry.frame.header.message_id;
            let attempts = entry.tx_count;
            self.abandon(message_id, attempts, now, output);
            return;
        }

        entry.retries += 1;
        entry.tx_count += 1;
        entry.sent_at = now;
        entry.timer.arm(now, rto);
        debug!(
            peer = %self.peer,
            sequence = seq,
            attempt = entry.tx_count,
            ?rto,
            "retransmitting"
        );
        output.frames.push(entry.frame.clone());
        output.retransmissions += 1;
    }

    fn abandon(&mut self, message_id: u16, attempts: u32, now: Instant, output: &mut SessionOutput) {
        self.in_flight
            .retain(|_, entry| entry.frame.header.message_id != message_id);
        self.backlog.retain(|pending| pending.message_id != message_id);
        self.messages.remove(&message_id);

        warn!(peer = %self.peer, message_id, attempts, "message abandoned");
        output.events.push(TransportEvent::Failed {
            peer: self.peer,
            message_id,
            error: TransportError::DeliveryFailure {
                peer: self.peer,
                message_id,
                attempts,
            },
        });

        self.advance_send_base();
        output.frames.extend(self.admit(now));
    }
}

/// Route a received control frame to the session.
pub fn dispatch_control(session: &mut Session, frame: &Frame, now: Instant) -> SessionOutput {
    match frame.kind() {
        FrameKind::Ack => session.on_ack(frame.header.sequence, now),
        FrameKind::Nack => session.on_nack(frame.header.sequence, now),
        FrameKind::Data => SessionOutput::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Address = Address(1);
    const B: Address = Address(2);

    fn config() -> TransportConfig {
        TransportConfig {
            window_size: 4,
            max_retries: 2,
            max_payload: 4,
            timer: TimerConfig {
                initial_rto: Duration::from_millis(100),
                min_rto: Duration::from_millis(10),
                max_rto: Duration::from_secs(1),
            },
            nack: true,
        }
    }

    fn pair() -> (Session, Session) {
        (Session::new(A, B, config()), Session::new(B, A, config()))
    }

    fn payloads(frames: &[Frame]) -> Vec<u8> {
        frames.iter().flat_map(|f| f.payload.clone()).collect()
    }

    #[test]
    fn initial_state() {
        let (a, _) = pair();
        assert_eq!(a.state(), SessionState::Idle);
        assert!(a.has_window_room());
        assert_eq!(a.next_deadline(), None);
    }

    #[test]
    fn single_frame_round_trip() {
        let (mut a, mut b) = pair();
        let now = Instant::now();

        let (id, frames) = a.send(b"HI", now).unwrap();
        assert_eq!(id, 0);
        assert_eq!(frames.len(), 1);
        assert_eq!(a.state(), SessionState::Sending);
        assert!(a.next_deadline().is_some());

        let outcome = b.on_data(frames[0].clone());
        assert_eq!(payloads(&outcome.delivered), b"HI");
        let ack = outcome.ack.unwrap();
        assert_eq!(ack.kind(), FrameKind::Ack);
        assert_eq!(ack.header.destination, A);

        let out = a.on_ack(ack.header.sequence, now + Duration::from_millis(5));
        assert_eq!(
            out.events,
            vec![TransportEvent::Delivered { peer: B, message_id: 0 }]
        );
        assert_eq!(a.state(), SessionState::Idle);
        assert_eq!(a.next_deadline(), None);
    }

    #[test]
    fn segmented_message_uses_window_and_backlog() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let data: Vec<u8> = (0..22).collect();

        // 6 fragments, window of 4
        let (id, frames) = a.send(&data, now).unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(a.backlog(), 2);
        assert_eq!(a.state(), SessionState::WaitingAck);
        assert!(!a.has_window_room());

        let mut received = Vec::new();
        let mut pending = frames;
        let mut events = Vec::new();
        while !pending.is_empty() {
            let mut next = Vec::new();
            for frame in pending {
                let outcome = b.on_data(frame);
                received.extend(outcome.delivered);
                let out = a.on_ack(outcome.ack.unwrap().header.sequence, now);
                next.extend(out.frames);
                events.extend(out.events);
            }
            pending = next;
        }

        assert_eq!(payloads(&received), data);
        assert_eq!(events, vec![TransportEvent::Delivered { peer: B, message_id: id }]);
        assert_eq!(a.state(), SessionState::Idle);
    }

    #[test]
    fn capacity_error_when_window_full() {
        let (mut a, _) = pair();
        let now = Instant::now();
        for _ in 0..4 {
            a.send(b"x", now).unwrap();
        }
        let err = a.send(b"x", now).unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::Capacity { peer: B, window: 4 })
        ));
    }

    #[test]
    fn out_of_order_frames_released_in_order() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let frames: Vec<Frame> = (0..3)
            .flat_map(|i| a.send(&[i], now).unwrap().1)
            .collect();

        let out = b.on_data(frames[2].clone());
        assert!(out.delivered.is_empty());
        assert!(out.ack.is_some());
        let out = b.on_data(frames[1].clone());
        assert!(out.delivered.is_empty());

        let out = b.on_data(frames[0].clone());
        assert_eq!(payloads(&out.delivered), vec![0, 1, 2]);
    }

    #[test]
    fn duplicate_is_acked_not_redelivered() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let (_, frames) = a.send(b"dup", now).unwrap();

        assert_eq!(b.on_data(frames[0].clone()).delivered.len(), 1);
        let again = b.on_data(frames[0].clone());
        assert!(again.delivered.is_empty());
        assert!(again.duplicate);
        assert_eq!(again.ack.unwrap().header.sequence, frames[0].header.sequence);
    }

    #[test]
    fn timeout_retransmits_identical_frame() {
        let (mut a, _) = pair();
        let start = Instant::now();
        let (_, frames) = a.send(b"HI", start).unwrap();

        assert!(a.poll_timers(start + Duration::from_millis(50)).frames.is_empty());

        let out = a.poll_timers(start + Duration::from_millis(100));
        assert_eq!(out.frames, frames);
        assert_eq!(out.retransmissions, 1);
        assert!(out.events.is_empty());
        // Backed off
        assert_eq!(a.rto(), Duration::from_millis(200));
    }

    #[test]
    fn abandoned_after_max_retries() {
        let (mut a, _) = pair();
        let mut now = Instant::now();
        let (id, _) = a.send(b"lost", now).unwrap();

        let mut retransmissions = 0;
        let mut failure = None;
        for _ in 0..10 {
            now += Duration::from_secs(2);
            let out = a.poll_timers(now);
            retransmissions += out.frames.len();
            if let Some(event) = out.events.into_iter().next() {
                failure = Some(event);
                break;
            }
        }

        assert_eq!(retransmissions, 2);
        assert_eq!(
            failure,
            Some(TransportEvent::Failed {
                peer: B,
                message_id: id,
                error: TransportError::DeliveryFailure {
                    peer: B,
                    message_id: id,
                    attempts: 3
                },
            })
        );
        assert_eq!(a.state(), SessionState::Idle);
        assert!(a.has_window_room());
    }

    #[test]
    fn abandonment_frees_window_and_receiver_skips_gap() {
        let (mut a, mut b) = pair();
        let mut now = Instant::now();

        let (_, lost) = a.send(b"lost", now).unwrap();
        assert_eq!(lost[0].header.sequence, 0);
        for _ in 0..3 {
            now += Duration::from_secs(2);
            a.poll_timers(now);
        }
        assert_eq!(a.state(), SessionState::Idle);

        // Receiver never saw seq 0; the next frame's window base lets it move on
        let (_, frames) = a.send(b"next", now).unwrap();
        assert_eq!(frames[0].header.sequence, 1);
        assert_eq!(frames[0].header.window_base, 1);

        let out = b.on_data(frames[0].clone());
        assert_eq!(payloads(&out.delivered), b"next");
    }

    #[test]
    fn nack_triggers_immediate_retransmission() {
        let (mut a, _) = pair();
        let now = Instant::now();
        let (_, frames) = a.send(b"HI", now).unwrap();

        let nack = Frame::nack(B, A, frames[0].header.sequence, 0);
        let out = dispatch_control(&mut a, &nack, now);
        assert_eq!(out.frames, frames);

        // Unknown sequence is ignored
        assert!(a.on_nack(99, now).frames.is_empty());
    }

    #[test]
    fn nacks_do_not_use_up_retries() {
        let (mut a, _) = pair();
        let start = Instant::now();
        let (_, frames) = a.send(b"HI", start).unwrap();
        let seq = frames[0].header.sequence;

        // Far more NACKs than max_retries, all before the timer fires
        for i in 1..=10 {
            let out = a.on_nack(seq, start + Duration::from_millis(i));
            assert_eq!(out.frames, frames);
            assert!(out.events.is_empty());
        }
        assert_eq!(a.in_flight(), 1);
        assert_eq!(a.next_deadline(), Some(start + Duration::from_millis(100)));

        // The first timeout is still only the first retry
        let out = a.poll_timers(start + Duration::from_millis(100));
        assert_eq!(out.frames, frames);
        assert!(out.events.is_empty());
    }

    #[test]
    fn nack_resend_skips_rtt_sample() {
        let (mut a, _) = pair();
        let start = Instant::now();
        let (_, frames) = a.send(b"x", start).unwrap();
        a.on_nack(frames[0].header.sequence, start);

        a.on_ack(frames[0].header.sequence, start + Duration::from_millis(900));
        assert_eq!(a.rto(), Duration::from_millis(100));
    }

    #[test]
    fn new_data_detection() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let frames: Vec<Frame> = (0..2)
            .flat_map(|i| a.send(&[i], now).unwrap().1)
            .collect();

        assert!(b.is_new_data(&frames[1].header));
        b.on_data(frames[1].clone());
        assert!(!b.is_new_data(&frames[1].header));
        assert!(b.is_new_data(&frames[0].header));
        b.on_data(frames[0].clone());
        // Delivered and acknowledged: a copy would only be re-acknowledged
        assert!(!b.is_new_data(&frames[0].header));
    }

    #[test]
    fn retransmitted_ack_skips_rtt_sample() {
        let (mut a, _) = pair();
        let start = Instant::now();
        let (_, frames) = a.send(b"x", start).unwrap();
        a.poll_timers(start + Duration::from_millis(100));

        a.on_ack(frames[0].header.sequence, start + Duration::from_millis(900));
        assert_eq!(a.rto(), Duration::from_millis(100));
    }

    #[test]
    fn close_fails_pending_and_is_terminal() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let (id, frames) = a.send(b"bye", now).unwrap();

        let events = a.close();
        assert_eq!(
            events,
            vec![TransportEvent::Failed {
                peer: B,
                message_id: id,
                error: TransportError::SessionClosed { peer: B },
            }]
        );
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(a.next_deadline(), None);
        assert!(matches!(
            a.send(b"more", now),
            Err(Error::Transport(TransportError::SessionClosed { .. }))
        ));

        b.close();
        assert_eq!(b.on_data(frames[0].clone()), DataOutcome::default());
    }

    #[test]
    fn reset_keeps_numbering() {
        let (mut a, mut b) = pair();
        let now = Instant::now();

        let (_, first) = a.send(b"one", now).unwrap();
        b.on_data(first[0].clone());
        a.send(b"two", now).unwrap();

        let events = a.reset();
        assert_eq!(events.len(), 2);
        assert_eq!(a.state(), SessionState::Idle);

        let (id, frames) = a.send(b"three", now).unwrap();
        assert_eq!(id, 2);
        assert_eq!(frames[0].header.sequence, 2);
        assert_eq!(frames[0].header.window_base, 2);

        // Receiver skips seq 1, which was never delivered
        assert_eq!(payloads(&b.on_data(frames[0].clone()).delivered), b"three");
    }

    #[test]
    fn sequence_numbers_wrap() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let mut received = Vec::new();

        for i in 0..600u32 {
            let byte = (i % 251) as u8;
            let (_, frames) = a.send(&[byte], now).unwrap();
            for frame in frames {
                let out = b.on_data(frame);
                received.extend(out.delivered);
                a.on_ack(out.ack.unwrap().header.sequence, now);
            }
        }

        assert_eq!(received.len(), 600);
        assert_eq!(received[599].payload, vec![(599 % 251) as u8]);
        assert_eq!(a.state(), SessionState::Idle);
    }

    #[test]
    fn config_validation() {
        assert!(TransportConfig::default().validate().is_ok());
        let bad = TransportConfig {
            window_size: 129,
            ..TransportConfig::default()
        };
        assert!(bad.validate().is_err());

        let cfg = TransportConfig::default().with_propagation_delay(Duration::from_millis(40));
        assert_eq!(cfg.timer.min_rto, Duration::from_millis(80));
        assert!(cfg.timer.initial_rto >= cfg.timer.min_rto);
    }
}
