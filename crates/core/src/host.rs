//! Host stack: transport sessions, reassembly and the host task.
//!
//! [`HostStack`] is the sans-IO core. It turns application messages into
//! waveforms and received waveforms into application events, and owns one
//! transport [`Session`] per peer plus the [`Reassembler`].
//!
//! [`Host::spawn`] runs a stack on its own task, wired to one medium link.
//! The application talks to it through a [`HostHandle`] and hears back on
//! an event channel:
//!
//! ```text
//! HostHandle ──commands──▶ host task ──LinkSender──▶ switch
//!                             ▲   │
//!                 LinkReceiver┘   └──events──▶ application
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{CodingError, Error, FramingError, ReassemblyError, Result, TransportError};
use crate::frame::{Address, Frame, FrameKind};
use crate::medium::{LinkReceiver, LinkSender};
use crate::metrics::HostMetrics;
use crate::pipeline::LinkCodec;
use crate::reassembly::Reassembler;
use crate::signal::SampleBuffer;
use crate::transport::{
    dispatch_control, Session, SessionOutput, SessionState, TransportConfig, TransportEvent,
};

/// Settings for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    pub address: Address,
    pub transport: TransportConfig,
    /// Partial messages tracked at once
    pub max_inflight_messages: usize,
    /// How long a blocking send waits for window room
    pub send_timeout: Duration,
}

impl HostConfig {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            transport: TransportConfig::default(),
            max_inflight_messages: 64,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// What the application hears from its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A complete message arrived
    Message { source: Address, data: Vec<u8> },
    /// A sent message was acknowledged in full
    Delivered { destination: Address, message_id: u16 },
    /// A sent message will never be delivered
    DeliveryFailed {
        destination: Address,
        message_id: u16,
        error: TransportError,
    },
}

/// How a send behaves when the window is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Wait up to the configured send timeout for room
    Blocking,
    /// Fail at once with `TransportError::Capacity`
    NonBlocking,
}

/// Units to transmit and events to report after a stack step.
#[derive(Debug, Default)]
pub struct HostOutput {
    pub units: Vec<SampleBuffer>,
    pub events: Vec<HostEvent>,
}

/// Sans-IO host protocol stack.
pub struct HostStack {
    config: HostConfig,
    codec: LinkCodec,
    sessions: HashMap<Address, Session>,
    reassembler: Reassembler,
    metrics: HostMetrics,
}

impl HostStack {
    pub fn new(config: HostConfig, codec: LinkCodec) -> Result<Self> {
        if !config.address.is_assigned() {
            return Err(Error::Config(format!(
                "host address {} is reserved",
                config.address
            )));
        }
        config.transport.validate()?;

        Ok(Self {
            reassembler: Reassembler::new(config.max_inflight_messages),
            config,
            codec,
            sessions: HashMap::new(),
            metrics: HostMetrics::new(),
        })
    }

    pub fn address(&self) -> Address {
        self.config.address
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn metrics(&self) -> &HostMetrics {
        &self.metrics
    }

    pub fn session(&self, peer: Address) -> Option<&Session> {
        self.sessions.get(&peer)
    }

    /// Whether a message to `destination` would be accepted now.
    pub fn can_send(&self, destination: Address) -> bool {
        self.sessions
            .get(&destination)
            .map_or(true, Session::has_window_room)
    }

    /// Queue a message and return its id plus the units to transmit now.
    ///
    /// # Errors
    /// - `Error::Config` for the unassigned address
    /// - `TransportError::{Capacity, SessionClosed, MessageTooLarge}` from the session
    pub fn send(
        &mut self,
        destination: Address,
        data: &[u8],
        now: Instant,
    ) -> Result<(u16, Vec<SampleBuffer>)> {
        if !destination.is_assigned() {
            return Err(Error::Config(format!(
                "cannot send to reserved address {destination}"
            )));
        }

        let (message_id, frames) = self.session_mut(destination).send(data, now)?;
        self.metrics.messages_sent += 1;
        self.metrics.data_frames_sent += frames.len() as u64;
        debug!(
            from = %self.config.address,
            to = %destination,
            message_id,
            bytes = data.len(),
            "message sent"
        );

        let units = frames.iter().map(|frame| self.codec.encode(frame)).collect();
        Ok((message_id, units))
    }

    /// Process one unit that arrived on the link.
    pub fn handle_unit(&mut self, unit: &SampleBuffer, now: Instant) -> HostOutput {
        let mut output = HostOutput::default();
        self.metrics.units_received += 1;

        let decoded = match self.codec.decode(unit) {
            Ok(decoded) => decoded,
            Err(Error::Coding(CodingError::Uncorrectable { coded_bits })) => {
                self.metrics.uncorrectable += 1;
                trace!(host = %self.config.address, coded_bits, "uncorrectable unit");
                return output;
            }
            Err(Error::Framing(FramingError::ChecksumMismatch { header, .. })) => {
                self.metrics.uncorrectable += 1;
                if self.config.transport.nack
                    && header.kind == FrameKind::Data
                    && header.destination == self.config.address
                    && header.source.is_assigned()
                {
                    let nack = Frame::nack(
                        self.config.address,
                        header.source,
                        header.sequence,
                        header.message_id,
                    );
                    self.metrics.nacks_sent += 1;
                    output.units.push(self.codec.encode(&nack));
                    trace!(host = %self.config.address, peer = %header.source, sequence = header.sequence, "nack");
                }
                return output;
            }
            Err(err) => {
                self.metrics.framing_errors += 1;
                trace!(host = %self.config.address, error = %err, "dropping malformed unit");
                return output;
            }
        };

        self.metrics.frames_received += 1;
        if decoded.corrected {
            self.metrics.corrected += 1;
        }

        let frame = decoded.frame;
        if frame.header.destination != self.config.address {
            self.metrics.misaddressed += 1;
            warn!(host = %self.config.address, destination = %frame.header.destination, "misaddressed frame");
            return output;
        }

        let peer = frame.header.source;
        match frame.kind() {
            FrameKind::Data => {
                // An ACK promises delivery, so a fragment reassembly cannot
                // hold goes unacknowledged and the sender tries again later
                let fresh = self
                    .sessions
                    .get(&peer)
                    .map_or(true, |session| session.is_new_data(&frame.header));
                if fresh && !self.reassembler.has_room_for(peer) {
                    self.metrics.fragments_refused += 1;
                    debug!(
                        host = %self.config.address,
                        from = %peer,
                        sequence = frame.header.sequence,
                        "reassembly full, leaving fragment unacknowledged"
                    );
                    return output;
                }

                let outcome = self.session_mut(peer).on_data(frame);
                if outcome.duplicate {
                    self.metrics.duplicates += 1;
                }
                if let Some(ack) = outcome.ack {
                    self.metrics.acks_sent += 1;
                    output.units.push(self.codec.encode(&ack));
                }
                for fragment in outcome.delivered {
                    self.reassemble(fragment, &mut output);
                }
            }
            FrameKind::Ack | FrameKind::Nack => {
                if frame.kind() == FrameKind::Ack {
                    self.metrics.acks_received += 1;
                } else {
                    self.metrics.nacks_received += 1;
                }
                // Control frames from a peer we never sent to are noise
                if let Some(session) = self.sessions.get_mut(&peer) {
                    let step = dispatch_control(session, &frame, now);
                    self.absorb(step, &mut output);
                }
            }
        }

        output
    }

    /// Fire expired retransmission timers.
    pub fn poll_timers(&mut self, now: Instant) -> HostOutput {
        let mut output = HostOutput::default();

        let steps: Vec<SessionOutput> = self
            .sessions
            .values_mut()
            .map(|session| session.poll_timers(now))
            .collect();
        for step in steps {
            self.absorb(step, &mut output);
        }
        output
    }

    /// Earliest instant at which [`poll_timers`](Self::poll_timers) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(Session::next_deadline)
            .min()
    }

    /// Close the session with `peer` for good.
    pub fn close_session(&mut self, peer: Address) -> Vec<HostEvent> {
        let events = self.session_mut(peer).close();
        self.reassembler.forget(peer);
        events.into_iter().map(|e| self.to_host_event(e)).collect()
    }

    /// Fail pending messages to `peer` but keep the session.
    pub fn reset_session(&mut self, peer: Address) -> Vec<HostEvent> {
        let events = match self.sessions.get_mut(&peer) {
            Some(session) => session.reset(),
            None => Vec::new(),
        };
        events.into_iter().map(|e| self.to_host_event(e)).collect()
    }

    /// Count a unit the link refused.
    pub fn record_link_error(&mut self) {
        self.metrics.link_errors += 1;
    }

    fn session_mut(&mut self, peer: Address) -> &mut Session {
        let local = self.config.address;
        let transport = self.config.transport;
        self.sessions
            .entry(peer)
            .or_insert_with(|| Session::new(local, peer, transport))
    }

    fn reassemble(&mut self, fragment: Frame, output: &mut HostOutput) {
        let result = self.reassembler.insert(fragment);
        for superseded in self.reassembler.take_superseded() {
            self.metrics.partial_messages_superseded += 1;
            debug!(host = %self.config.address, error = %superseded, "partial message dropped");
        }

        match result {
            Ok(Some(message)) => {
                self.metrics.messages_received += 1;
                debug!(
                    host = %self.config.address,
                    from = %message.source,
                    message_id = message.message_id,
                    bytes = message.data.len(),
                    "message received"
                );
                output.events.push(HostEvent::Message {
                    source: message.source,
                    data: message.data,
                });
            }
            Ok(None) => {}
            Err(Error::Reassembly(ReassemblyError::DuplicateFragment { .. })) => {
                self.metrics.duplicates += 1;
            }
            Err(err) => {
                warn!(host = %self.config.address, error = %err, "fragment dropped");
            }
        }
    }

    fn absorb(&mut self, step: SessionOutput, output: &mut HostOutput) {
        self.metrics.data_frames_sent += step.frames.len() as u64;
        self.metrics.retransmissions += step.retransmissions;
        output
            .units
            .extend(step.frames.iter().map(|frame| self.codec.encode(frame)));
        for event in step.events {
            let event = self.to_host_event(event);
            output.events.push(event);
        }
    }

    fn to_host_event(&mut self, event: TransportEvent) -> HostEvent {
        match event {
            TransportEvent::Delivered { peer, message_id } => {
                self.metrics.messages_delivered += 1;
                HostEvent::Delivered {
                    destination: peer,
                    message_id,
                }
            }
            TransportEvent::Failed {
                peer,
                message_id,
                error,
            } => {
                self.metrics.messages_failed += 1;
                HostEvent::DeliveryFailed {
                    destination: peer,
                    message_id,
                    error,
                }
            }
        }
    }
}

enum Command {
    Send {
        destination: Address,
        data: Vec<u8>,
        mode: SendMode,
        reply: oneshot::Sender<Result<u16>>,
    },
    CloseSession {
        peer: Address,
        reply: oneshot::Sender<()>,
    },
    ResetSession {
        peer: Address,
        reply: oneshot::Sender<()>,
    },
    Metrics {
        reply: oneshot::Sender<HostMetrics>,
    },
}

/// A blocking send waiting for window room.
struct ParkedSend {
    destination: Address,
    data: Vec<u8>,
    deadline: Instant,
    reply: oneshot::Sender<Result<u16>>,
}

/// Application-side handle to a running host. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HostHandle {
    address: Address,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Send { destination, data, mode, .. } => f
                .debug_struct("Send")
                .field("destination", destination)
                .field("bytes", &data.len())
                .field("mode", mode)
                .finish(),
            Command::CloseSession { peer, .. } => write!(f, "CloseSession({peer})"),
            Command::ResetSession { peer, .. } => write!(f, "ResetSession({peer})"),
            Command::Metrics { .. } => write!(f, "Metrics"),
        }
    }
}

impl HostHandle {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Send a message, waiting up to the send timeout for window room.
    ///
    /// Returns the message id once the message is accepted. Delivery is
    /// reported later as [`HostEvent::Delivered`] or
    /// [`HostEvent::DeliveryFailed`].
    pub async fn send(&self, destination: Address, data: impl Into<Vec<u8>>) -> Result<u16> {
        self.submit(destination, data.into(), SendMode::Blocking).await
    }

    /// Send a message, failing at once with `TransportError::Capacity` if
    /// the window is full.
    pub async fn try_send(&self, destination: Address, data: impl Into<Vec<u8>>) -> Result<u16> {
        self.submit(destination, data.into(), SendMode::NonBlocking)
            .await
    }

    pub async fn send_with_mode(
        &self,
        destination: Address,
        data: impl Into<Vec<u8>>,
        mode: SendMode,
    ) -> Result<u16> {
        self.submit(destination, data.into(), mode).await
    }

    /// Close the session with `peer`. Pending messages are reported failed.
    pub async fn close_session(&self, peer: Address) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::CloseSession { peer, reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Abort pending messages to `peer` without closing the session.
    pub async fn reset_session(&self, peer: Address) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::ResetSession { peer, reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn metrics(&self) -> Result<HostMetrics> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Metrics { reply }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Stop the host task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn submit(&self, destination: Address, data: Vec<u8>, mode: SendMode) -> Result<u16> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            destination,
            data,
            mode,
            reply,
        })
        .await?;
        rx.await.map_err(|_| stopped())?
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| stopped())
    }
}

fn stopped() -> Error {
    Error::Channel("host task stopped".into())
}

/// Spawns host tasks.
pub struct Host;

impl Host {
    /// Run `stack` on its own task.
    ///
    /// The task exits when `cancel` fires, every handle is dropped, or the
    /// link closes. Must be called from within a tokio runtime.
    pub fn spawn(
        stack: HostStack,
        link_tx: LinkSender,
        link_rx: LinkReceiver,
        cancel: CancellationToken,
    ) -> (HostHandle, mpsc::UnboundedReceiver<HostEvent>) {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = cancel.child_token();
        let handle = HostHandle {
            address: stack.address(),
            commands: commands_tx,
            cancel: cancel.clone(),
        };

        let task = HostTask {
            stack,
            link_tx,
            events: events_tx,
            parked: VecDeque::new(),
        };
        tokio::spawn(task.run(commands_rx, link_rx, cancel));

        (handle, events_rx)
    }
}

struct HostTask {
    stack: HostStack,
    link_tx: LinkSender,
    events: mpsc::UnboundedSender<HostEvent>,
    parked: VecDeque<ParkedSend>,
}

impl HostTask {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut link_rx: LinkReceiver,
        cancel: CancellationToken,
    ) {
        let address = self.stack.address();
        info!(host = %address, "host started");

        loop {
            let wake = self.next_wake();
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                unit = link_rx.receive() => match unit {
                    Some(unit) => {
                        let output = self.stack.handle_unit(&unit, Instant::now());
                        self.emit(output);
                    }
                    None => break,
                },
                _ = sleep_until(wake) => {
                    let output = self.stack.poll_timers(Instant::now());
                    self.emit(output);
                }
            }
            self.unpark(Instant::now());
        }

        for parked in self.parked.drain(..) {
            let _ = parked.reply.send(Err(stopped()));
        }
        info!(host = %address, "host stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                destination,
                data,
                mode,
                reply,
            } => {
                let waiting_behind = self.parked.iter().any(|p| p.destination == destination);
                let closed = self.session_closed(destination);
                let result = match mode {
                    _ if closed || (!waiting_behind && self.stack.can_send(destination)) => {
                        self.send_now(destination, &data)
                    }
                    SendMode::Blocking => {
                        trace!(to = %destination, "send parked until the window opens");
                        self.parked.push_back(ParkedSend {
                            destination,
                            data,
                            deadline: Instant::now() + self.stack.config().send_timeout,
                            reply,
                        });
                        return;
                    }
                    SendMode::NonBlocking => Err(TransportError::Capacity {
                        peer: destination,
                        window: self.stack.config().transport.window_size,
                    }
                    .into()),
                };
                let _ = reply.send(result);
            }
            Command::CloseSession { peer, reply } => {
                let events = self.stack.close_session(peer);
                self.publish(events);
                // Parked sends to a closed session can never go out
                self.unpark(Instant::now());
                let _ = reply.send(());
            }
            Command::ResetSession { peer, reply } => {
                let events = self.stack.reset_session(peer);
                self.publish(events);
                let _ = reply.send(());
            }
            Command::Metrics { reply } => {
                let _ = reply.send(self.stack.metrics().clone());
            }
        }
    }

    fn send_now(&mut self, destination: Address, data: &[u8]) -> Result<u16> {
        let (message_id, units) = self.stack.send(destination, data, Instant::now())?;
        self.transmit(units);
        Ok(message_id)
    }

    /// Release parked sends whose window opened, and time out the rest.
    ///
    /// Sends to one destination leave in the order they were made.
    fn unpark(&mut self, now: Instant) {
        let mut blocked: HashSet<Address> = HashSet::new();
        let mut still_parked = VecDeque::new();

        while let Some(parked) = self.parked.pop_front() {
            let closed = self.session_closed(parked.destination);

            if !blocked.contains(&parked.destination)
                && (closed || self.stack.can_send(parked.destination))
            {
                let result = self.send_now(parked.destination, &parked.data);
                let _ = parked.reply.send(result);
            } else if now >= parked.deadline {
                blocked.insert(parked.destination);
                let window = self.stack.config().transport.window_size;
                let _ = parked.reply.send(Err(TransportError::Capacity {
                    peer: parked.destination,
                    window,
                }
                .into()));
            } else {
                blocked.insert(parked.destination);
                still_parked.push_back(parked);
            }
        }

        self.parked = still_parked;
    }

    fn session_closed(&self, peer: Address) -> bool {
        self.stack
            .session(peer)
            .is_some_and(|s| s.state() == SessionState::Closed)
    }

    fn next_wake(&self) -> Option<Instant> {
        self.stack
            .next_deadline()
            .into_iter()
            .chain(self.parked.iter().map(|p| p.deadline))
            .min()
    }

    fn emit(&mut self, output: HostOutput) {
        self.transmit(output.units);
        self.publish(output.events);
    }

    fn transmit(&mut self, units: Vec<SampleBuffer>) {
        for unit in units {
            if let Err(err) = self.link_tx.send(unit) {
                self.stack.record_link_error();
                warn!(host = %self.stack.address(), error = %err, "link refused unit");
            }
        }
    }

    fn publish(&self, events: Vec<HostEvent>) {
        for event in events {
            // The application may have stopped listening
            let _ = self.events.send(event);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
