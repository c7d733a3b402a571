//! The peer registry: authoritative mapping from assigned VPN address to
//! live session, plus the directory broadcast.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tokio::io::AsyncWrite;

use crate::error::{Error, Result};
use crate::protocol::channel::ChannelWriter;
use crate::protocol::control::ControlMessage;
use crate::transport::StreamWriter;
use crate::types::{HelloInfo, PeerInfo};
use crate::VPN_SERVER_ADDR;

/// Last assignable host number in the /24.
const LAST_HOST: u32 = 254;

/// A registered session as the registry and router see it.
pub struct SessionHandle<W = StreamWriter> {
    /// Assigned VPN address; the session's identity.
    pub vpn_addr: Ipv4Addr,
    /// Directory entry broadcast to all clients.
    pub info: PeerInfo,
    /// Outbound record injector, shared with the session's flusher.
    pub writer: Arc<ChannelWriter<W>>,
}

struct RegistryInner<W> {
    sessions: HashMap<Ipv4Addr, Arc<SessionHandle<W>>>,
    // Host counter; only increases, so addresses are never recycled
    // within a server lifetime.
    next_host: u32,
}

/// Address → session map with a monotone allocator.
///
/// Reads (router lookups) vastly outnumber writes (register/deregister),
/// hence the reader-writer lock.
pub struct PeerRegistry<W = StreamWriter> {
    inner: RwLock<RegistryInner<W>>,
}

impl<W> Default for PeerRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> PeerRegistry<W> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                // 10.8.0.1 is the server.
                next_host: 2,
            }),
        }
    }

    /// Reserve the next VPN address. The counter never decreases; an
    /// allocated address is unique for the lifetime of the process even
    /// if the session never registers.
    pub fn allocate(&self) -> Result<Ipv4Addr> {
        let mut inner = self.inner.write();
        if inner.next_host > LAST_HOST {
            return Err(Error::AddressPoolExhausted);
        }
        let octets = VPN_SERVER_ADDR.octets();
        let addr = Ipv4Addr::new(octets[0], octets[1], octets[2], inner.next_host as u8);
        inner.next_host += 1;
        Ok(addr)
    }

    /// Look up a live session by address.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<Arc<SessionHandle<W>>> {
        self.inner.read().sessions.get(&addr).cloned()
    }

    /// Current directory snapshot.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.inner
            .read()
            .sessions
            .values()
            .map(|s| s.info.clone())
            .collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }
}

impl<W> PeerRegistry<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Insert a session under its allocated address and broadcast the new
    /// directory.
    pub fn register(
        &self,
        vpn_addr: Ipv4Addr,
        hello: &HelloInfo,
        public_ip: &str,
        writer: Arc<ChannelWriter<W>>,
    ) -> Arc<SessionHandle<W>> {
        let info = PeerInfo {
            hostname: hello.hostname.clone(),
            vpn_address: vpn_addr.to_string(),
            public_ip: public_ip.to_string(),
            connected_at: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
            os: hello.os.clone(),
        };

        let handle = Arc::new(SessionHandle {
            vpn_addr,
            info,
            writer,
        });

        self.inner
            .write()
            .sessions
            .insert(vpn_addr, Arc::clone(&handle));

        tracing::info!(
            peer = %handle.info.hostname,
            os = %handle.info.os,
            addr = %vpn_addr,
            "registered peer"
        );
        self.broadcast_directory();
        handle
    }

    /// Remove a session and broadcast the shrunken directory.
    pub fn deregister(&self, addr: Ipv4Addr) {
        let removed = self.inner.write().sessions.remove(&addr);
        if let Some(handle) = removed {
            tracing::info!(peer = %handle.info.hostname, addr = %addr, "unregistered peer");
            self.broadcast_directory();
        }
    }

    /// Send the current peer list to every registered session.
    pub fn broadcast_directory(&self) {
        let peers = self.snapshot();
        tracing::debug!(count = peers.len(), "broadcasting peer directory");
        self.broadcast(&ControlMessage::PeerList(peers));
    }

    /// Fire-and-forget a control message to every registered session; a
    /// slow or broken session never blocks the others.
    pub fn broadcast(&self, msg: &ControlMessage) {
        let payload = msg.encode();
        let handles: Vec<_> = self.inner.read().sessions.values().cloned().collect();

        for handle in handles {
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Err(e) = handle.writer.send(&payload).await {
                    tracing::warn!(
                        addr = %handle.vpn_addr,
                        error = %e,
                        "control broadcast failed"
                    );
                }
            });
        }
    }

    /// Send a control message to one peer; unknown addresses error.
    pub async fn send_to_peer(&self, addr: Ipv4Addr, msg: &ControlMessage) -> Result<()> {
        let handle = self.lookup(addr).ok_or(Error::PeerNotFound(addr))?;
        handle.writer.send(&msg.encode()).await
    }
}
