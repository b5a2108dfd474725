//! Configuration for the cablenet-sim application.
//!
//! Handles parsing command-line arguments and generating sensible defaults
//! (including randomized cable impairments that are reproducible with a seed).
//!
//! # Philosophy
//!
//! The tool should work with ZERO arguments. Every default is printed with
//! `--print-config` so a run can be repeated exactly.

use cablenet_core::coding::ChannelCoding;
use cablenet_core::medium::CableConfig;
use cablenet_core::signal::Modulation;
use cablenet_core::topology::TopologyConfig;
use cablenet_core::transport::TransportConfig;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Complete configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct Config {
    // === Topology ===
    /// Hosts around the switch
    pub hosts: usize,

    /// Link settings shared by every host and the switch
    pub network: TopologyConfig,

    // === Traffic ===
    /// Messages each host sends
    pub messages: usize,

    /// Seed for cables and traffic
    pub seed: u64,

    // === Behavior ===
    /// Whether to print detailed config
    pub print_config: bool,

    /// Whether to print per-host metrics
    pub print_metrics: bool,
}

/// Pull the value following a flag.
fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse<T: std::str::FromStr>(text: &str, what: &str) -> Result<T, String> {
    text.parse().map_err(|_| format!("invalid {what}: {text}"))
}

fn parse_scheme(text: &str) -> Result<Modulation, String> {
    match text.to_ascii_lowercase().as_str() {
        "ask" => Ok(Modulation::Ask),
        "fsk" => Ok(Modulation::Fsk),
        "psk" => Ok(Modulation::Psk),
        _ => Err(format!("unknown scheme: {text} (expected ask, fsk or psk)")),
    }
}

fn parse_coding(text: &str) -> Result<ChannelCoding, String> {
    match text.to_ascii_lowercase().as_str() {
        "none" => Ok(ChannelCoding::None),
        "crc" | "crc32" => Ok(ChannelCoding::Crc32),
        "hamming" => Ok(ChannelCoding::Hamming),
        _ => Err(format!(
            "unknown coding: {text} (expected none, crc or hamming)"
        )),
    }
}

impl Config {
    /// Parse configuration from command-line arguments.
    ///
    /// Without `--seed` the seed comes from the clock. Impairments not given
    /// on the command line are drawn from the seed.
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        let mut hosts: Option<usize> = None;
        let mut scheme: Option<Modulation> = None;
        let mut coding: Option<ChannelCoding> = None;
        let mut noise: Option<f64> = None;
        let mut attenuation: Option<f64> = None;
        let mut length: Option<f64> = None;
        let mut loss: Option<f64> = None;
        let mut window: Option<usize> = None;
        let mut retries: Option<u32> = None;
        let mut messages: Option<usize> = None;
        let mut max_payload: Option<usize> = None;
        let mut seed: Option<u64> = None;
        let mut print_config = false;
        let mut print_metrics = true;

        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--hosts" => hosts = Some(parse(value(args, &mut i, flag)?, "host count")?),
                "--scheme" => scheme = Some(parse_scheme(value(args, &mut i, flag)?)?),
                "--coding" => coding = Some(parse_coding(value(args, &mut i, flag)?)?),
                "--noise" => noise = Some(parse(value(args, &mut i, flag)?, "noise level")?),
                "--attenuation" => {
                    attenuation = Some(parse(value(args, &mut i, flag)?, "attenuation")?)
                }
                "--length" => length = Some(parse(value(args, &mut i, flag)?, "cable length")?),
                "--loss" => loss = Some(parse(value(args, &mut i, flag)?, "loss rate")?),
                "--window" => window = Some(parse(value(args, &mut i, flag)?, "window size")?),
                "--retries" => retries = Some(parse(value(args, &mut i, flag)?, "retry count")?),
                "--messages" => {
                    messages = Some(parse(value(args, &mut i, flag)?, "message count")?)
                }
                "--max-payload" => {
                    max_payload = Some(parse(value(args, &mut i, flag)?, "max payload")?)
                }
                "--seed" => seed = Some(parse(value(args, &mut i, flag)?, "seed")?),
                "--print-config" => print_config = true,
                "--no-metrics" => print_metrics = false,
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => return Err(format!("unknown argument: {flag}")),
            }
            i += 1;
        }

        let seed = seed.unwrap_or_else(|| {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |t| t.as_millis() as u64)
        });
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let hosts = hosts.unwrap_or(3);
        if !(2..=254).contains(&hosts) {
            return Err(format!("--hosts must be between 2 and 254, got {hosts}"));
        }

        let defaults = TransportConfig::default();
        let cable = CableConfig {
            length_m: length.unwrap_or_else(|| rng.gen_range(10.0..=500.0)),
            attenuation: attenuation.unwrap_or_else(|| rng.gen_range(0.0..=0.3)),
            noise_level: noise.unwrap_or_else(|| rng.gen_range(0.0..=0.4)),
            loss_rate: loss.unwrap_or_else(|| {
                // Bias toward small loss rates
                let r: f64 = rng.gen();
                (r * r * 0.05).min(0.05)
            }),
            ..CableConfig::default_with_seed(seed)
        };

        let network = TopologyConfig {
            scheme: scheme.unwrap_or(Modulation::Psk),
            coding: coding.unwrap_or(ChannelCoding::Hamming),
            cable,
            transport: TransportConfig {
                window_size: window.unwrap_or(defaults.window_size),
                max_retries: retries.unwrap_or(defaults.max_retries),
                max_payload: max_payload.unwrap_or(defaults.max_payload),
                ..defaults
            },
            ..TopologyConfig::default()
        };
        network.validate().map_err(|e| e.to_string())?;

        Ok(Config {
            hosts,
            network,
            messages: messages.unwrap_or(5),
            seed,
            print_config,
            print_metrics,
        })
    }

    /// Print the configuration in human-readable form.
    pub fn print(&self) {
        let net = &self.network;
        println!("=== Configuration ===");
        println!("Seed: {}", self.seed);
        println!("Hosts: {}", self.hosts);
        println!("Messages per host: {}", self.messages);
        println!();
        println!("=== Link ===");
        println!("Modulation: {:?}", net.scheme);
        println!("Channel coding: {:?}", net.coding);
        println!(
            "Samples per bit: {} at {} Hz",
            net.params.samples_per_bit, net.params.sample_rate
        );
        println!();
        println!("=== Cable ===");
        println!("Length: {:.1} m", net.cable.length_m);
        println!("Attenuation: {:.3} per 100 m", net.cable.attenuation);
        println!("Noise level: {:.3}", net.cable.noise_level);
        println!("Loss rate: {:.2}%", net.cable.loss_rate * 100.0);
        println!();
        println!("=== Transport ===");
        println!("Window: {} frames", net.transport.window_size);
        println!("Max retries: {}", net.transport.max_retries);
        println!("Max payload: {} bytes", net.transport.max_payload);
        println!("Initial RTO: {:?}", net.transport.timer.initial_rto);
        println!();
    }
}

fn print_help() {
    println!("cablenet-sim: Layered network over a simulated cable");
    println!();
    println!("USAGE:");
    println!("    cablenet-sim [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --hosts <N>             Hosts around the switch (default: 3)");
    println!("    --scheme <S>            ask, fsk or psk (default: psk)");
    println!("    --coding <C>            none, crc or hamming (default: hamming)");
    println!("    --seed <N>              Random seed for determinism");
    println!();
    println!("    --noise <X>             Noise std dev (default: random 0-0.4)");
    println!("    --attenuation <X>       Attenuation per 100 m (default: random 0-0.3)");
    println!("    --length <M>            Cable length in meters (default: random 10-500)");
    println!("    --loss <P>              Unit erasure rate 0.0-1.0 (default: random 0-0.05)");
    println!();
    println!("    --window <N>            Transport window (default: 8)");
    println!("    --retries <N>           Retransmissions before giving up (default: 5)");
    println!("    --max-payload <N>       Bytes per frame (default: 32)");
    println!("    --messages <N>          Messages sent by each host (default: 5)");
    println!();
    println!("    --print-config          Print resolved configuration");
    println!("    --no-metrics            Don't print metrics summary");
    println!("    --help, -h              Print this help");
    println!();
    println!("EXAMPLES:");
    println!("    cablenet-sim                               # Random impairments");
    println!("    cablenet-sim --seed 42                     # Deterministic run");
    println!("    cablenet-sim --noise 0 --loss 0 --coding none");
    println!("    cablenet-sim --hosts 6 --scheme fsk --loss 0.1");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_seeded_defaults_are_reproducible() {
        let a = Config::from_args(&args(&["--seed", "9"])).unwrap();
        let b = Config::from_args(&args(&["--seed", "9"])).unwrap();
        assert_eq!(a.network, b.network);
        assert_eq!(a.hosts, 3);
    }

    #[test]
    fn test_explicit_values() {
        let config = Config::from_args(&args(&[
            "--seed", "1", "--hosts", "5", "--scheme", "FSK", "--coding", "crc", "--noise", "0",
            "--loss", "0", "--window", "4", "--no-metrics",
        ]))
        .unwrap();
        assert_eq!(config.hosts, 5);
        assert_eq!(config.network.scheme, Modulation::Fsk);
        assert_eq!(config.network.coding, ChannelCoding::Crc32);
        assert_eq!(config.network.cable.noise_level, 0.0);
        assert_eq!(config.network.cable.loss_rate, 0.0);
        assert_eq!(config.network.transport.window_size, 4);
        assert!(!config.print_metrics);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Config::from_args(&args(&["--hosts"])).is_err());
        assert!(Config::from_args(&args(&["--hosts", "1"])).is_err());
        assert!(Config::from_args(&args(&["--scheme", "qam"])).is_err());
        assert!(Config::from_args(&args(&["--loss", "2"])).is_err());
        assert!(Config::from_args(&args(&["--window", "0"])).is_err());
        assert!(Config::from_args(&args(&["--bogus"])).is_err());
    }
}
