//! Shared harness: in-process TUN mocks over loopback TCP.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

use veles::client::{handshake, ClientPaths, ClientSession, ClientState};
use veles::crypto::PresharedKey;
use veles::error::Result;
use veles::server::{PeerRegistry, VpnServer};
use veles::transport::dial;
use veles::tun::PacketIo;
use veles::types::{HelloInfo, Shutdown};

/// A TUN device backed by channels: tests inject packets that the stack
/// will "read from the TUN", and observe packets the stack "writes to it".
pub struct MockTun {
    incoming: Mutex<mpsc::Receiver<Vec<u8>>>,
    written: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait::async_trait]
impl PacketIo for MockTun {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(pkt) => {
                let n = pkt.len().min(buf.len());
                buf[..n].copy_from_slice(&pkt[..n]);
                Ok(n)
            }
            // Injector gone: behave like a quiet TUN, not a dead one.
            None => std::future::pending().await,
        }
    }

    async fn send(&self, pkt: &[u8]) -> Result<usize> {
        // Packets no test observes just vanish, like a kernel would drop.
        let _ = self.written.send(pkt.to_vec());
        Ok(pkt.len())
    }
}

/// Build a mock TUN plus its test-side handles.
pub fn mock_tun() -> (
    Arc<MockTun>,
    mpsc::Sender<Vec<u8>>,
    mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (inject_tx, inject_rx) = mpsc::channel(256);
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let tun = Arc::new(MockTun {
        incoming: Mutex::new(inject_rx),
        written: written_tx,
    });
    (tun, inject_tx, written_rx)
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<PeerRegistry>,
    pub shutdown: Shutdown,
    /// Inject packets as if the kernel routed them into the server TUN.
    pub tun_inject: mpsc::Sender<Vec<u8>>,
    /// Packets the server wrote toward the kernel.
    pub tun_written: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub async fn spawn_server(key: &PresharedKey) -> TestServer {
    let (tun, tun_inject, tun_written) = mock_tun();
    let server = Arc::new(VpnServer::new(tun, key.clone(), None));
    let registry = server.registry();
    let shutdown = server.shutdown_handle();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = server.run(listener).await;
    });

    TestServer {
        addr,
        registry,
        shutdown,
        tun_inject,
        tun_written,
    }
}

pub struct TestClient {
    pub assigned: Ipv4Addr,
    pub shutdown: Shutdown,
    pub state: Arc<ClientState>,
    pub ipc_addr: SocketAddr,
    pub paths: ClientPaths,
    /// Inject packets as if an application wrote them into the client TUN.
    pub tun_inject: mpsc::Sender<Vec<u8>>,
    /// Packets the client wrote toward its applications.
    pub tun_written: mpsc::UnboundedReceiver<Vec<u8>>,
    _scratch: tempfile::TempDir,
}

/// Connect a full client session (pumps, IPC surface, signal watcher) to
/// the server; `key` enables per-record encryption.
pub async fn connect_client(server: &TestServer, key: Option<&PresharedKey>) -> TestClient {
    let mut stream = dial(&server.addr.to_string(), false).await.unwrap();
    let hello = HelloInfo {
        hostname: "testbox".to_string(),
        os: "linux".to_string(),
    };
    let assigned = handshake(&mut stream, key.is_some(), &hello).await.unwrap();

    let scratch = tempfile::tempdir().unwrap();
    let paths = ClientPaths {
        peers_file: scratch.path().join("peers.json"),
        update_signal_file: scratch.path().join("update-signal"),
        signal_dir: scratch.path().join("signals"),
    };

    let (tun, tun_inject, tun_written) = mock_tun();
    let session = ClientSession::new(tun, stream, key.cloned(), paths.clone());
    let state = session.state();
    let shutdown = session.shutdown_handle();

    let ipc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ipc_addr = ipc_listener.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = session.run(ipc_listener).await;
    });

    TestClient {
        assigned,
        shutdown,
        state,
        ipc_addr,
        paths,
        tun_inject,
        tun_written,
        _scratch: scratch,
    }
}

/// Await a packet from a mock-TUN outbox, with a deadline.
pub async fn expect_packet(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("packet channel closed")
}

/// Poll a condition until it holds or the deadline passes.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if condition() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
