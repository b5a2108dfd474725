//! cablenet-core: a layered communication stack over a simulated cable
//!
//! This library provides the pieces of a small network that moves bytes
//! as analog waveforms:
//! - Modulates bits onto a carrier (ASK, FSK, PSK) and back
//! - Protects frames with CRC-32 detection or Hamming SECDED correction
//! - Frames, addresses and segments messages
//! - Forwards units between ports through a concurrent switch
//! - Delivers messages reliably with a selective-repeat transport
//!
//! # Architecture
//!
//! The stack is built bottom-up with clear module boundaries:
//! - `bitio`: Bit sequences and bit-level reading/writing
//! - `signal`: Sample buffers and the modulation codec
//! - `coding`: Channel codes
//! - `medium`: Cable model and the delay-line link adapter
//! - `frame`: Frame format, addressing and segmentation
//! - `pipeline`: Frame ⇄ waveform for one link
//! - `reassembly`: Fragment reassembly with bounded memory
//! - `switch`: Forwarding table and per-port forwarding tasks
//! - `timer`: Retransmission timeout estimation
//! - `transport`: Per-peer reliable sessions
//! - `host`: Host protocol stack and its task
//! - `topology`: Star network wiring
//! - `metrics`: Per-host counters
//!
//! # Design Principles
//!
//! - **No panics**: All errors are structured and recoverable
//! - **Bounded memory**: Links, windows and reassembly have fixed limits
//! - **Deterministic**: Seeded randomness makes noisy runs reproducible
//! - **Sans-IO cores**: Protocol state machines take the time as an
//!   argument; tasks only move data

pub mod bitio;
pub mod coding;
pub mod error;
pub mod frame;
pub mod host;
pub mod medium;
pub mod metrics;
pub mod pipeline;
pub mod reassembly;
pub mod signal;
pub mod switch;
pub mod timer;
pub mod topology;
pub mod transport;

// Re-export commonly used types
pub use error::{Error, Result};
pub use frame::Address;
pub use host::{HostEvent, HostHandle};
pub use topology::{Network, TopologyConfig};
