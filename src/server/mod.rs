//! The VPN server: accept loop, per-client sessions, the centralized TUN
//! router and the peer registry.

pub mod http;
pub mod registry;
pub mod router;
pub mod session;

pub use registry::{PeerRegistry, SessionHandle};
pub use router::TunRouter;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::crypto::PresharedKey;
use crate::error::Result;
use crate::transport::{tune_socket, TunnelStream};
use crate::tun::PacketIo;
use crate::types::Shutdown;

pub struct VpnServer {
    registry: Arc<PeerRegistry>,
    tun: Arc<dyn PacketIo>,
    key: PresharedKey,
    tls: Option<TlsAcceptor>,
    shutdown: Shutdown,
}

impl VpnServer {
    /// Build a server around an already-configured TUN device (or a mock
    /// in tests). Platform setup — addresses, forwarding, MSS clamping —
    /// is the binary's concern.
    pub fn new(tun: Arc<dyn PacketIo>, key: PresharedKey, tls: Option<TlsAcceptor>) -> Self {
        Self {
            registry: Arc::new(PeerRegistry::new()),
            tun,
            key,
            tls,
            shutdown: Shutdown::new(),
        }
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run the router and the accept loop until shutdown.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let router = TunRouter::new(
            Arc::clone(&self.tun),
            Arc::clone(&self.registry),
            self.shutdown.clone(),
        );
        let router_task = tokio::spawn(router.run());

        let local = listener.local_addr()?;
        tracing::info!(
            addr = %local,
            tls = self.tls.is_some(),
            "VPN server listening"
        );

        loop {
            let (tcp, peer) = tokio::select! {
                () = self.shutdown.triggered() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            if let Err(e) = tune_socket(&tcp) {
                tracing::warn!(peer = %peer, error = %e, "socket tuning failed");
            }

            let tls = self.tls.clone();
            let registry = Arc::clone(&self.registry);
            let tun = Arc::clone(&self.tun);
            let key = self.key.clone();
            let shutdown = self.shutdown.clone();

            tokio::spawn(async move {
                // The TLS handshake happens inside the per-connection task
                // so a stalled client cannot block the accept loop.
                let stream = match tls {
                    Some(acceptor) => match acceptor.accept(tcp).await {
                        Ok(tls_stream) => TunnelStream::ServerTls(Box::new(tls_stream)),
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "TLS accept failed");
                            return;
                        }
                    },
                    None => TunnelStream::Plain(tcp),
                };

                if let Err(e) =
                    session::handle_connection(stream, registry, tun, key, shutdown).await
                {
                    tracing::debug!(peer = %peer, error = %e, "session error");
                }
            });
        }

        self.shutdown.trigger();
        let _ = router_task.await;
        tracing::info!("server stopped");
        Ok(())
    }
}
