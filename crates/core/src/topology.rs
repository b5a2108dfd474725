//! Star topology: hosts around one switch.
//!
//! ```text
//!  host #1 ──cable──▶ port 0 ┐            ┌ port 0 ──cable──▶ host #1
//!  host #2 ──cable──▶ port 1 ┼─ switch ───┼ port 1 ──cable──▶ host #2
//!  host #n ──cable──▶ port n ┘            └ port n ──cable──▶ host #n
//! ```
//!
//! Every direction of every link is its own [`Cable`] with its own seed, so
//! a run is reproducible from the configured cable seed.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coding::ChannelCoding;
use crate::error::{Error, Result};
use crate::frame::Address;
use crate::host::{Host, HostConfig, HostEvent, HostHandle, HostStack};
use crate::medium::{Cable, CableConfig, Channel, MediumAdapter};
use crate::pipeline::LinkCodec;
use crate::signal::{CodecParams, Modulation};
use crate::switch::{PortId, Switch, SwitchConfig, SwitchHandle, SwitchStatsSnapshot};
use crate::transport::TransportConfig;

/// Which way a link carries units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    HostToSwitch,
    SwitchToHost,
}

/// Everything needed to build a [`Network`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopologyConfig {
    pub scheme: Modulation,
    pub params: CodecParams,
    pub coding: ChannelCoding,
    /// Template for every cable; each link gets a derived seed
    pub cable: CableConfig,
    pub transport: TransportConfig,
    pub switch: SwitchConfig,
    /// Units queued per link before sends are refused
    pub link_capacity: usize,
    pub send_timeout: Duration,
    pub max_inflight_messages: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            scheme: Modulation::default(),
            params: CodecParams::default(),
            coding: ChannelCoding::default(),
            cable: CableConfig::default_with_seed(0),
            transport: TransportConfig::default(),
            switch: SwitchConfig::default(),
            link_capacity: 256,
            send_timeout: Duration::from_secs(5),
            max_inflight_messages: 64,
        }
    }
}

impl TopologyConfig {
    pub fn validate(&self) -> Result<()> {
        self.params.validate()?;
        self.cable.validate()?;
        self.transport.validate()?;
        if self.link_capacity == 0 {
            return Err(Error::Config("link capacity must be at least 1".into()));
        }
        if self.max_inflight_messages == 0 {
            return Err(Error::Config(
                "max_inflight_messages must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Cable for one direction of one port.
    fn cable_for(&self, port: PortId, direction: LinkDirection) -> CableConfig {
        let lane = match direction {
            LinkDirection::HostToSwitch => 0,
            LinkDirection::SwitchToHost => 1,
        };
        let seed = self
            .cable
            .seed
            .wrapping_add((port as u64).wrapping_mul(2).wrapping_add(lane));
        self.cable.with_seed(seed)
    }
}

struct Member {
    handle: HostHandle,
    events: Option<mpsc::UnboundedReceiver<HostEvent>>,
}

/// A running star network.
pub struct Network {
    hosts: BTreeMap<Address, Member>,
    switch: SwitchHandle,
    cancel: CancellationToken,
}

impl Network {
    /// Build a star of [`Cable`] links, one port per address.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(config: TopologyConfig, addresses: &[Address]) -> Result<Self> {
        let cables = config;
        Self::build_with_channels(config, addresses, move |port, direction| -> Box<dyn Channel> {
            Box::new(Cable::new(cables.cable_for(port, direction)))
        })
    }

    /// Build a star whose links use channels from `factory`.
    ///
    /// The factory is called twice per port, once per direction. Receivers
    /// expect the amplitude left by the weakest uplink and downlink, scaled
    /// by `params.path_gain` for any loss outside the channels.
    ///
    /// # Errors
    /// - `Error::Config` for an invalid configuration, the unassigned
    ///   address or a duplicate address
    pub fn build_with_channels<F>(
        config: TopologyConfig,
        addresses: &[Address],
        mut factory: F,
    ) -> Result<Self>
    where
        F: FnMut(PortId, LinkDirection) -> Box<dyn Channel>,
    {
        config.validate()?;
        let mut seen = HashSet::new();
        for &address in addresses {
            if !address.is_assigned() {
                return Err(Error::Config(format!("address {address} is reserved")));
            }
            if !seen.insert(address) {
                return Err(Error::Config(format!("address {address} used twice")));
            }
        }

        let links: Vec<(Box<dyn Channel>, Box<dyn Channel>)> = (0..addresses.len())
            .map(|port| {
                (
                    factory(port, LinkDirection::HostToSwitch),
                    factory(port, LinkDirection::SwitchToHost),
                )
            })
            .collect();

        // The switch forwards raw samples, so a host hears both hops' loss.
        // The weakest link sets the ASK decision threshold.
        let uplink_gain = links.iter().map(|(up, _)| up.gain()).fold(1.0, f64::min);
        let downlink_gain = links.iter().map(|(_, down)| down.gain()).fold(1.0, f64::min);
        let switch_params = config
            .params
            .with_path_gain(config.params.path_gain * uplink_gain);
        let host_params = config
            .params
            .with_path_gain(config.params.path_gain * uplink_gain * downlink_gain);
        debug!(uplink_gain, downlink_gain, "link gains");

        let codec = LinkCodec::new(config.scheme, host_params, config.coding)?;
        let switch_codec = LinkCodec::new(config.scheme, switch_params, config.coding)?;
        let cancel = CancellationToken::new();
        let switch = Switch::new(addresses.len(), switch_codec, config.switch);

        let mut ingress = Vec::with_capacity(addresses.len());
        let mut egress = Vec::with_capacity(addresses.len());
        let mut host_links = Vec::with_capacity(addresses.len());
        let mut longest_hop = Duration::ZERO;

        for (port, (&address, (uplink, downlink))) in addresses.iter().zip(links).enumerate() {
            switch.bind(address, port)?;

            longest_hop = longest_hop
                .max(uplink.propagation_delay())
                .max(downlink.propagation_delay());

            let (up_tx, up_rx) = MediumAdapter::spawn(uplink, config.link_capacity, cancel.clone());
            let (down_tx, down_rx) =
                MediumAdapter::spawn(downlink, config.link_capacity, cancel.clone());
            ingress.push(up_rx);
            egress.push(down_tx);
            host_links.push((address, up_tx, down_rx));
        }

        let switch = switch.spawn(ingress, egress, cancel.clone())?;

        // Host to host is two hops
        let transport = config
            .transport
            .with_propagation_delay(longest_hop.saturating_mul(2));

        let mut hosts = BTreeMap::new();
        for (address, link_tx, link_rx) in host_links {
            let host_config = HostConfig {
                address,
                transport,
                max_inflight_messages: config.max_inflight_messages,
                send_timeout: config.send_timeout,
            };
            let stack = HostStack::new(host_config, codec.clone())?;
            let (handle, events) = Host::spawn(stack, link_tx, link_rx, cancel.clone());
            hosts.insert(
                address,
                Member {
                    handle,
                    events: Some(events),
                },
            );
        }

        info!(hosts = hosts.len(), scheme = ?config.scheme, coding = ?config.coding, "network up");
        Ok(Self {
            hosts,
            switch,
            cancel,
        })
    }

    pub fn host(&self, address: Address) -> Option<&HostHandle> {
        self.hosts.get(&address).map(|member| &member.handle)
    }

    /// Addresses in ascending order.
    pub fn addresses(&self) -> Vec<Address> {
        self.hosts.keys().copied().collect()
    }

    /// Take the event stream of a host. Returns `None` the second time.
    pub fn take_events(&mut self, address: Address) -> Option<mpsc::UnboundedReceiver<HostEvent>> {
        self.hosts
            .get_mut(&address)
            .and_then(|member| member.events.take())
    }

    pub fn switch(&self) -> &SwitchHandle {
        &self.switch
    }

    pub fn switch_stats(&self) -> SwitchStatsSnapshot {
        self.switch.stats()
    }

    /// Stop every host, link and switch task.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.switch.shutdown().await;
        info!("network down");
    }
}
