//! cablenet-sim: drive generated traffic through a simulated star network.
//!
//! Builds one switch with a host on every port, has each host send its
//! planned messages, waits until every message is delivered or given up,
//! then checks each received payload against what was sent.

mod config;
mod traffic;

use std::collections::HashMap;
use std::process::ExitCode;
use std::time::Duration;

use cablenet_core::{Address, HostEvent, Network};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use traffic::{plan_traffic, PlannedMessage};

/// Upper bound on one run.
const RUN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct Tally {
    delivered: usize,
    failed: usize,
    received: usize,
    mismatched: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!("run with --help for usage");
            return ExitCode::from(2);
        }
    };
    if config.print_config {
        config.print();
    }

    match run(&config).await {
        Ok(tally) if tally.mismatched == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = %err, "run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &Config) -> cablenet_core::Result<Tally> {
    let addresses: Vec<Address> = (1..=config.hosts as u8).map(Address).collect();
    let mut network = Network::build(config.network, &addresses)?;

    // Merge every host's events into one stream
    let (merged_tx, mut merged) = mpsc::unbounded_channel();
    for &address in &addresses {
        let Some(mut events) = network.take_events(address) else {
            continue;
        };
        let merged_tx = merged_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if merged_tx.send((address, event)).is_err() {
                    break;
                }
            }
        });
    }
    drop(merged_tx);

    let plan = plan_traffic(config.seed, &addresses, config.messages);
    let mut expected: HashMap<(Address, Address), Vec<Vec<u8>>> = HashMap::new();
    for message in &plan {
        expected
            .entry((message.from, message.to))
            .or_default()
            .push(message.data.clone());
    }
    info!(messages = plan.len(), hosts = addresses.len(), "sending");

    // One sender per host so a full window only stalls that host
    let mut senders = Vec::new();
    for &address in &addresses {
        let Some(handle) = network.host(address).cloned() else {
            continue;
        };
        let outgoing: Vec<PlannedMessage> = plan
            .iter()
            .filter(|m| m.from == address)
            .cloned()
            .collect();
        senders.push(tokio::spawn(async move {
            let mut accepted = 0usize;
            for message in outgoing {
                match handle.send(message.to, message.data).await {
                    Ok(_) => accepted += 1,
                    Err(err) => warn!(from = %message.from, to = %message.to, error = %err, "send rejected"),
                }
            }
            accepted
        }));
    }
    let mut accepted = 0;
    for sender in senders {
        accepted += sender.await.unwrap_or(0);
    }

    let mut tally = Tally::default();
    let outcome = tokio::time::timeout(RUN_TIMEOUT, async {
        // A message event is published before the ACK that completes
        // delivery leaves the receiver, but forwarders may reorder them
        while tally.delivered + tally.failed < accepted || tally.received < tally.delivered {
            let Some((host, event)) = merged.recv().await else {
                break;
            };
            match event {
                HostEvent::Message { source, data } => {
                    tally.received += 1;
                    let matched = expected
                        .get_mut(&(source, host))
                        .and_then(|pending| {
                            let at = pending.iter().position(|d| *d == data)?;
                            Some(pending.swap_remove(at))
                        })
                        .is_some();
                    if !matched {
                        tally.mismatched += 1;
                        error!(%source, %host, bytes = data.len(), "received a payload that was never sent");
                    }
                }
                HostEvent::Delivered { .. } => tally.delivered += 1,
                HostEvent::DeliveryFailed {
                    destination, error, ..
                } => {
                    tally.failed += 1;
                    warn!(from = %host, to = %destination, %error, "delivery failed");
                }
            }
        }
    })
    .await;
    if outcome.is_err() {
        warn!("gave up waiting for outstanding messages");
    }

    println!("=== Summary ===");
    println!(
        "{} planned, {} accepted, {} delivered, {} failed, {} received, {} mismatched",
        plan.len(),
        accepted,
        tally.delivered,
        tally.failed,
        tally.received,
        tally.mismatched
    );

    if config.print_metrics {
        let stats = network.switch_stats();
        println!();
        println!("=== Switch ===");
        println!(
            "  {} forwarded, {} unknown destination, {} malformed, {} egress failures",
            stats.forwarded, stats.unknown_destination, stats.malformed, stats.egress_failures
        );
        for &address in &addresses {
            if let Some(handle) = network.host(address) {
                let metrics = handle.metrics().await?;
                println!();
                println!("=== Host {address} ===");
                println!("{metrics}");
            }
        }
    }

    network.shutdown().await;
    Ok(tally)
}
