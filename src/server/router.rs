//! The centralized TUN router.
//!
//! Exactly one task reads the server's TUN device. Per-session readers
//! would race and duplicate packets; instead this router parses each
//! packet's destination and hands it to the owning session's outbound
//! writer. Destinations that are not registered peers are dropped
//! silently — the kernel's routing table owns Internet-bound traffic, so
//! only VPN-subnet packets ever reach the TUN.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::server::registry::PeerRegistry;
use crate::tun::{packet, PacketIo};
use crate::types::Shutdown;
use crate::MTU;

pub struct TunRouter {
    tun: Arc<dyn PacketIo>,
    registry: Arc<PeerRegistry>,
    shutdown: Shutdown,
}

impl TunRouter {
    pub fn new(tun: Arc<dyn PacketIo>, registry: Arc<PeerRegistry>, shutdown: Shutdown) -> Self {
        Self {
            tun,
            registry,
            shutdown,
        }
    }

    /// Read and dispatch until shutdown. TUN read failures are fatal;
    /// per-session write failures are expected when peers disconnect and
    /// only drop that packet.
    pub async fn run(self) -> Result<()> {
        let mut buf = vec![0u8; MTU];
        tracing::info!("TUN router started");

        loop {
            if !self.shutdown.is_active() {
                return Ok(());
            }

            let n = tokio::select! {
                () = self.shutdown.triggered() => return Ok(()),
                result = self.tun.recv(&mut buf) => result?,
            };

            let Some(dest) = packet::ipv4_destination(&buf[..n]) else {
                continue;
            };

            let Some(session) = self.registry.lookup(dest) else {
                // Not a peer; the kernel routes it.
                continue;
            };

            // Sealed per the session's negotiated preference inside the
            // writer; serialized with control injection by its mutex.
            if let Err(e) = session.writer.send(&buf[..n]).await {
                tracing::debug!(dest = %dest, error = %e, "router write failed");
            }
        }
    }
}

/// The ingress-side counterpart of the router, interposed between each
/// session's ingress pump and the server TUN.
///
/// A decrypted packet destined to a registered peer is handed straight to
/// that peer's tunnel; everything else goes to the kernel via the TUN.
/// Peer-to-peer traffic therefore never appears on the server-kernel side.
pub struct PeerDispatcher {
    tun: Arc<dyn PacketIo>,
    registry: Arc<PeerRegistry>,
}

impl PeerDispatcher {
    pub fn new(tun: Arc<dyn PacketIo>, registry: Arc<PeerRegistry>) -> Self {
        Self { tun, registry }
    }
}

#[async_trait]
impl PacketIo for PeerDispatcher {
    async fn recv(&self, _buf: &mut [u8]) -> Result<usize> {
        // The centralized router is the only TUN reader.
        Err(Error::Internal("dispatcher is write-only".into()))
    }

    async fn send(&self, pkt: &[u8]) -> Result<usize> {
        if let Some(dest) = packet::ipv4_destination(pkt) {
            if let Some(session) = self.registry.lookup(dest) {
                // A dying target session drops the packet, it never
                // tears down the sending session.
                if let Err(e) = session.writer.send(pkt).await {
                    tracing::debug!(dest = %dest, error = %e, "peer forward failed");
                }
                return Ok(pkt.len());
            }
        }

        // Internet-bound (or non-IPv4): the kernel routes it.
        self.tun.send(pkt).await
    }
}
