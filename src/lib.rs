//! # Veles
//!
//! Small multi-user VPN over TCP: a central server terminates framed,
//! authenticated tunnels from remote clients, assigns each one a private
//! virtual address, and forwards IP packets between clients and the
//! Internet, and between the clients themselves.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Client: TUN ⇄ tunnel endpoint ⇄ framed crypto channel ⇄ TCP    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Server: per-session ingress → TUN; one central TUN router      │
//! │          dispatches TUN reads to peer sessions or the kernel    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Control channel (peer directory, signaling) multiplexed on     │
//! │  the same record stream, tagged with a reserved prefix          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Loopback HTTP IPC for out-of-process extensions                │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)] // Record lengths are bounded well below u32::MAX
#![allow(clippy::cast_precision_loss)]      // Acceptable for throughput stats
#![allow(clippy::doc_markdown)]             // ASCII diagrams in docs
#![allow(clippy::future_not_send)]          // Async internals
#![allow(clippy::similar_names)]

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod tun;
pub mod tunnel;
pub mod types;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::Config;
pub use error::{Error, Result};

use std::net::Ipv4Addr;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum transmission unit for the virtual interface.
///
/// 1400 leaves headroom (~28 bytes) for the AEAD nonce and tag within a
/// typical Internet MTU.
pub const MTU: usize = 1400;

/// Maximum payload length of one record on the wire.
///
/// A length field exceeding this is a fatal framing error.
pub const MAX_RECORD_LEN: usize = 2 * MTU;

/// Reserved prefix marking a control message; never written to a TUN.
pub const CTRL_PREFIX: &[u8] = b"CTRL:";

/// The server's address inside the VPN subnet.
pub const VPN_SERVER_ADDR: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 1);

/// Prefix length of the VPN subnet (10.8.0.0/24).
pub const VPN_NETMASK: u8 = 24;

/// Default listen port; 443 so the TLS-wrapped flow resembles HTTPS.
pub const DEFAULT_PORT: u16 = 443;

/// MSS clamp applied on the server forwarding chain: MTU - 40.
pub const CLAMPED_MSS: u16 = 1360;
