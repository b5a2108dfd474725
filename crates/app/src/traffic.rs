//! Demo traffic generation.
//!
//! Every host sends a fixed number of messages to peers picked at random.
//! Payloads mix the shapes a link sees in practice so framing and coding
//! are exercised:
//! - Short text lines
//! - Runs of one byte
//! - Random bytes, some longer than one frame
//! - The occasional empty message

use cablenet_core::Address;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Longest generated payload.
pub const MAX_MESSAGE_BYTES: usize = 300;

/// One message the demo will send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMessage {
    pub from: Address,
    pub to: Address,
    pub data: Vec<u8>,
}

/// Plan `per_host` messages from every host to random other hosts.
///
/// Needs at least two hosts; returns nothing otherwise.
pub fn plan_traffic(seed: u64, hosts: &[Address], per_host: usize) -> Vec<PlannedMessage> {
    if hosts.len() < 2 {
        return Vec::new();
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ 0x7261_6666_6963);
    let mut plan = Vec::with_capacity(hosts.len() * per_host);

    for (i, &from) in hosts.iter().enumerate() {
        for _ in 0..per_host {
            // Any host but ourselves
            let mut j = rng.gen_range(0..hosts.len() - 1);
            if j >= i {
                j += 1;
            }
            plan.push(PlannedMessage {
                from,
                to: hosts[j],
                data: generate_payload(&mut rng),
            });
        }
    }
    plan
}

/// Generate one payload of random shape and size.
pub fn generate_payload(rng: &mut ChaCha8Rng) -> Vec<u8> {
    let kind: u8 = rng.gen_range(0..20);
    match kind {
        0 => Vec::new(),

        // Text-like
        1..=8 => {
            let alphabet = b"abcdefghijklmnopqrstuvwxyz .!,\n";
            let len = rng.gen_range(1..=80);
            (0..len)
                .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
                .collect()
        }

        // Runs
        9..=12 => {
            let byte: u8 = rng.gen();
            vec![byte; rng.gen_range(1..=64)]
        }

        // Random bytes
        _ => {
            let len = rng.gen_range(1..=MAX_MESSAGE_BYTES);
            (0..len).map(|_| rng.gen()).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Vec<Address> {
        (1..=4).map(Address).collect()
    }

    #[test]
    fn test_plan_size_and_peers() {
        let plan = plan_traffic(42, &hosts(), 10);
        assert_eq!(plan.len(), 40);
        for message in &plan {
            assert_ne!(message.from, message.to);
            assert!(message.data.len() <= MAX_MESSAGE_BYTES);
        }
    }

    #[test]
    fn test_determinism() {
        assert_eq!(plan_traffic(7, &hosts(), 5), plan_traffic(7, &hosts(), 5));
        assert_ne!(plan_traffic(7, &hosts(), 5), plan_traffic(8, &hosts(), 5));
    }

    #[test]
    fn test_too_few_hosts() {
        assert!(plan_traffic(1, &[Address(1)], 3).is_empty());
    }
}
