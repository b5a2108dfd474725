//! N-port switch with a shared forwarding table.
//!
//! The switch reads only the address prefix of each unit and forwards the
//! unmodified waveform to the egress port bound to the destination. Units
//! for unknown destinations are dropped and counted; nothing is flooded.
//!
//! Every ingress port runs its own receive-and-forward task. The only state
//! those tasks share is the [`ForwardingTable`] and the atomic counters, so
//! a slow or busy port never holds up another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, FramingError, Result, SwitchError};
use crate::frame::{Address, ADDRESS_PREFIX_BITS};
use crate::medium::{LinkReceiver, LinkSender};
use crate::pipeline::LinkCodec;
use crate::signal::SampleBuffer;

/// Index of a switch port.
pub type PortId = usize;

/// Address → port map, safe for concurrent lookups.
///
/// Writes take the lock briefly and are last-writer-wins per address.
#[derive(Debug, Clone, Default)]
pub struct ForwardingTable {
    inner: Arc<RwLock<HashMap<Address, PortId>>>,
}

impl ForwardingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an address to a port, replacing any previous binding.
    pub fn bind(&self, address: Address, port: PortId) {
        self.write().insert(address, port);
    }

    /// Record that `address` was seen on `port`.
    ///
    /// Returns true if the table changed. Takes the write lock only when it
    /// has to.
    pub fn learn(&self, address: Address, port: PortId) -> bool {
        if self.lookup(address) == Some(port) {
            return false;
        }
        self.write().insert(address, port) != Some(port)
    }

    pub fn lookup(&self, address: Address) -> Option<PortId> {
        self.read().get(&address).copied()
    }

    pub fn remove(&self, address: Address) -> Option<PortId> {
        self.write().remove(&address)
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A panic while holding the lock cannot leave the map half-updated, so
    // a poisoned lock is still safe to use.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Address, PortId>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Address, PortId>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Switch behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwitchConfig {
    /// Learn source addresses from traffic in addition to static bindings
    pub learning: bool,
}

/// Live counters, updated from every port task.
#[derive(Debug, Default)]
pub struct SwitchStats {
    forwarded: AtomicU64,
    unknown_destination: AtomicU64,
    malformed: AtomicU64,
    egress_failures: AtomicU64,
}

impl SwitchStats {
    pub fn snapshot(&self) -> SwitchStatsSnapshot {
        SwitchStatsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            unknown_destination: self.unknown_destination.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            egress_failures: self.egress_failures.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.forwarded,
            &self.unknown_destination,
            &self.malformed,
            &self.egress_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of [`SwitchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchStatsSnapshot {
    /// Units handed to an egress link
    pub forwarded: u64,
    /// Units dropped because the destination is not in the table
    pub unknown_destination: u64,
    /// Units whose address prefix could not be read
    pub malformed: u64,
    /// Units the egress link refused
    pub egress_failures: u64,
}

/// Forwarding logic for one switch.
pub struct Switch {
    ports: usize,
    codec: LinkCodec,
    config: SwitchConfig,
    table: ForwardingTable,
    stats: SwitchStats,
}

impl Switch {
    pub fn new(ports: usize, codec: LinkCodec, config: SwitchConfig) -> Self {
        Self {
            ports,
            codec,
            config,
            table: ForwardingTable::new(),
            stats: SwitchStats::default(),
        }
    }

    pub fn ports(&self) -> usize {
        self.ports
    }

    pub fn table(&self) -> &ForwardingTable {
        &self.table
    }

    pub fn stats(&self) -> SwitchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Statically bind an address to a port.
    ///
    /// # Errors
    /// - `SwitchError::InvalidPort` if the port does not exist
    /// - `Error::Config` for the reserved unassigned address
    pub fn bind(&self, address: Address, port: PortId) -> Result<()> {
        self.check_port(port)?;
        if !address.is_assigned() {
            return Err(Error::Config(format!("address {address} is reserved")));
        }
        self.table.bind(address, port);
        debug!(%address, port, "address bound");
        Ok(())
    }

    /// Decide where a unit arriving on `ingress` goes.
    ///
    /// Only the address prefix is decoded.
    ///
    /// # Errors
    /// - `SwitchError::InvalidPort` for a bad ingress port
    /// - `SwitchError::UnknownDestination` if no port is bound to the destination
    /// - codec or framing errors if the prefix is unreadable
    pub fn route(&self, ingress: PortId, unit: &SampleBuffer) -> Result<PortId> {
        self.check_port(ingress)?;

        let addresses = match self.codec.read_addresses(unit) {
            Ok(addresses) => addresses,
            Err(err) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        let Some((source, destination)) = addresses else {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return Err(FramingError::FrameTooShort {
                required: ADDRESS_PREFIX_BITS,
                actual: unit.len() / self.codec.signal().params().samples_per_bit,
            }
            .into());
        };

        if self.config.learning && source.is_assigned() && self.table.learn(source, ingress) {
            debug!(%source, port = ingress, "address learned");
        }

        let egress = if destination.is_assigned() {
            self.table.lookup(destination)
        } else {
            None
        };
        match egress {
            Some(port) => Ok(port),
            None => {
                self.stats.unknown_destination.fetch_add(1, Ordering::Relaxed);
                warn!(%destination, %source, ingress, "dropping unit for unknown destination");
                Err(SwitchError::UnknownDestination {
                    destination,
                    ingress,
                }
                .into())
            }
        }
    }

    /// Clear the forwarding table and counters.
    pub fn reset(&self) {
        self.table.clear();
        self.stats.reset();
    }

    /// Start one forwarding task per ingress port.
    ///
    /// `ingress[i]` and `egress[i]` are port `i`. Tasks run until `cancel`
    /// fires or their ingress link closes.
    ///
    /// # Errors
    /// `Error::Config` if the link counts do not match the port count.
    pub fn spawn(
        self,
        ingress: Vec<LinkReceiver>,
        egress: Vec<LinkSender>,
        cancel: CancellationToken,
    ) -> Result<SwitchHandle> {
        if ingress.len() != self.ports || egress.len() != self.ports {
            return Err(Error::Config(format!(
                "switch has {} ports but got {} ingress and {} egress links",
                self.ports,
                ingress.len(),
                egress.len()
            )));
        }

        let switch = Arc::new(self);
        let egress = Arc::new(egress);
        let tasks = ingress
            .into_iter()
            .enumerate()
            .map(|(port, link)| {
                tokio::spawn(port_task(
                    Arc::clone(&switch),
                    port,
                    link,
                    Arc::clone(&egress),
                    cancel.clone(),
                ))
            })
            .collect();

        info!(ports = switch.ports, "switch started");
        Ok(SwitchHandle {
            switch,
            tasks,
            cancel,
        })
    }

    fn check_port(&self, port: PortId) -> Result<()> {
        if port >= self.ports {
            return Err(SwitchError::InvalidPort {
                port,
                ports: self.ports,
            }
            .into());
        }
        Ok(())
    }
}

async fn port_task(
    switch: Arc<Switch>,
    port: PortId,
    mut link: LinkReceiver,
    egress: Arc<Vec<LinkSender>>,
    cancel: CancellationToken,
) {
    loop {
        let unit = tokio::select! {
            _ = cancel.cancelled() => break,
            unit = link.receive() => match unit {
                Some(unit) => unit,
                None => break,
            },
        };

        // Errors are counted inside route()
        let Ok(out) = switch.route(port, &unit) else {
            continue;
        };

        match egress[out].send(unit) {
            Ok(_) => {
                switch.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                trace!(ingress = port, egress = out, "forwarded");
            }
            Err(err) => {
                switch.stats.egress_failures.fetch_add(1, Ordering::Relaxed);
                warn!(ingress = port, egress = out, error = %err, "egress refused unit");
            }
        }
    }
    debug!(port, "switch port stopped");
}

/// Running switch.
pub struct SwitchHandle {
    switch: Arc<Switch>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl SwitchHandle {
    pub fn switch(&self) -> &Switch {
        &self.switch
    }

    pub fn stats(&self) -> SwitchStatsSnapshot {
        self.switch.stats()
    }

    /// Stop every port task and wait for them.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("switch stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::ChannelCoding;
    use crate::frame::Frame;
    use crate::medium::{Cable, CableConfig, MediumAdapter};
    use crate::signal::{CodecParams, Modulation};
    use std::time::Duration;

    fn codec() -> LinkCodec {
        LinkCodec::new(Modulation::Ask, CodecParams::default(), ChannelCoding::Hamming).unwrap()
    }

    fn unit(src: u8, dst: u8, payload: &[u8]) -> SampleBuffer {
        codec().encode(&Frame::data(
            Address(src),
            Address(dst),
            0,
            0,
            0,
            0,
            1,
            payload.to_vec(),
        ))
    }

    fn three_port_switch() -> Switch {
        let switch = Switch::new(3, codec(), SwitchConfig::default());
        for port in 0..3 {
            switch.bind(Address(port as u8 + 1), port).unwrap();
        }
        switch
    }

    #[test]
    fn test_table_learn_last_writer_wins() {
        let table = ForwardingTable::new();
        assert!(table.is_empty());
        assert!(table.learn(Address(1), 0));
        assert!(!table.learn(Address(1), 0));
        assert!(table.learn(Address(1), 2));
        assert_eq!(table.lookup(Address(1)), Some(2));
        assert_eq!(table.remove(Address(1)), Some(2));
        assert_eq!(table.lookup(Address(1)), None);
    }

    #[test]
    fn test_route_to_bound_port_only() {
        let switch = three_port_switch();
        for (ingress, dst, expected) in [(0, 2, 1), (0, 3, 2), (1, 1, 0), (2, 2, 1)] {
            let out = switch.route(ingress, &unit(ingress as u8 + 1, dst, b"x")).unwrap();
            assert_eq!(out, expected);
        }
    }

    #[test]
    fn test_unknown_destination_dropped() {
        let switch = three_port_switch();
        let result = switch.route(0, &unit(1, 9, b"x"));
        assert!(matches!(
            result,
            Err(Error::Switch(SwitchError::UnknownDestination {
                destination: Address(9),
                ingress: 0
            }))
        ));
        assert_eq!(switch.stats().unknown_destination, 1);
    }

    #[test]
    fn test_erased_unit_goes_nowhere() {
        let switch = three_port_switch();
        // Silence decodes to address 0, which is never bound
        let erased = SampleBuffer::silence(unit(1, 2, b"x").len(), 48_000);
        assert!(switch.route(0, &erased).is_err());
        assert_eq!(switch.stats().unknown_destination, 1);
    }

    #[test]
    fn test_short_unit_is_malformed() {
        let switch = three_port_switch();
        let result = switch.route(0, &SampleBuffer::silence(48, 48_000));
        assert!(matches!(
            result,
            Err(Error::Framing(FramingError::FrameTooShort { .. }))
        ));
        assert_eq!(switch.stats().malformed, 1);
    }

    #[test]
    fn test_invalid_ports() {
        let switch = three_port_switch();
        assert!(matches!(
            switch.route(3, &unit(1, 2, b"x")),
            Err(Error::Switch(SwitchError::InvalidPort { port: 3, ports: 3 }))
        ));
        assert!(switch.bind(Address(4), 7).is_err());
        assert!(switch.bind(Address(0), 1).is_err());
    }

    #[test]
    fn test_learning() {
        let switch = Switch::new(2, codec(), SwitchConfig { learning: true });
        assert!(switch.route(1, &unit(5, 6, b"x")).is_err());
        assert_eq!(switch.table().lookup(Address(5)), Some(1));

        assert_eq!(switch.route(0, &unit(6, 5, b"x")).unwrap(), 1);

        switch.reset();
        assert!(switch.table().is_empty());
        assert_eq!(switch.stats(), SwitchStatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_concurrent_ports_forward_independently() {
        let cancel = CancellationToken::new();
        let mut ingress_tx = Vec::new();
        let mut ingress_rx = Vec::new();
        let mut egress_tx = Vec::new();
        let mut egress_rx = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = MediumAdapter::spawn(Cable::new(CableConfig::ideal(0)), 16, cancel.clone());
            ingress_tx.push(tx);
            ingress_rx.push(rx);
            let (tx, rx) = MediumAdapter::spawn(Cable::new(CableConfig::ideal(0)), 16, cancel.clone());
            egress_tx.push(tx);
            egress_rx.push(rx);
        }

        let handle = three_port_switch()
            .spawn(ingress_rx, egress_tx, cancel.clone())
            .unwrap();

        // Host 1 -> 3 and host 2 -> 1 at the same time
        let a = unit(1, 3, b"PING");
        let b = unit(2, 1, b"PONG");
        ingress_tx[0].send(a.clone()).unwrap();
        ingress_tx[1].send(b.clone()).unwrap();

        let at_3 = tokio::time::timeout(Duration::from_secs(5), egress_rx[2].receive())
            .await
            .unwrap()
            .unwrap();
        let at_1 = tokio::time::timeout(Duration::from_secs(5), egress_rx[0].receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(at_3, a);
        assert_eq!(at_1, b);

        // Port 2 (host 2) saw nothing
        let nothing =
            tokio::time::timeout(Duration::from_millis(50), egress_rx[1].receive()).await;
        assert!(nothing.is_err());

        assert_eq!(handle.stats().forwarded, 2);
        handle.shutdown().await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_spawn_rejects_wrong_link_count() {
        let cancel = CancellationToken::new();
        let (tx, rx) = MediumAdapter::spawn(Cable::new(CableConfig::ideal(0)), 4, cancel.clone());
        let result = three_port_switch().spawn(vec![rx], vec![tx], cancel.clone());
        assert!(matches!(result, Err(Error::Config(_))));
        cancel.cancel();
    }
}
