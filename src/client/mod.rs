//! The client session: handshake, tunnel endpoint, control handling and
//! the local extension surfaces.

pub mod ipc;
pub mod signals;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::config::IpcConfig;
use crate::crypto::{PresharedKey, RecordCipher};
use crate::error::{Error, Result};
use crate::protocol::channel::{ChannelReader, ChannelWriter};
use crate::protocol::control::ControlMessage;
use crate::protocol::framing::{
    read_frame, write_frame, RecordReader, RecordWriter, CLIENT_FLUSH_THRESHOLD,
    CLIENT_WRITER_CAPACITY,
};
use crate::transport::TunnelStream;
use crate::tun::PacketIo;
use crate::tunnel::stats::DirectionStats;
use crate::tunnel::TunnelEndpoint;
use crate::types::{HelloInfo, PeerInfo, Shutdown};
use signals::{extension_for, SignalEnvelope, SignalQueues};

/// Largest acceptable assigned-address frame.
const MAX_ADDR_LEN: usize = 64;

/// Well-known paths the client publishes to and watches.
#[derive(Debug, Clone)]
pub struct ClientPaths {
    /// Current peer directory, JSON, for external UIs.
    pub peers_file: PathBuf,
    /// One-line update token for the out-of-process supervisor.
    pub update_signal_file: PathBuf,
    /// Directory of outgoing signal drops.
    pub signal_dir: PathBuf,
}

impl From<&IpcConfig> for ClientPaths {
    fn from(config: &IpcConfig) -> Self {
        Self {
            peers_file: config.peers_file.clone(),
            update_signal_file: config.update_signal_file.clone(),
            signal_dir: config.signal_dir.clone(),
        }
    }
}

/// State shared between the control loop and the IPC surface.
pub struct ClientState {
    shutdown: Shutdown,
    peers: RwLock<Vec<PeerInfo>>,
    queues: SignalQueues,
    paths: ClientPaths,
}

impl ClientState {
    pub fn new(shutdown: Shutdown, paths: ClientPaths) -> Self {
        Self {
            shutdown,
            peers: RwLock::new(Vec::new()),
            queues: SignalQueues::new(),
            paths,
        }
    }

    /// Whether the tunnel is live; mirrored into `/health`.
    pub fn enabled(&self) -> bool {
        self.shutdown.is_active()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().clone()
    }

    pub fn queues(&self) -> &SignalQueues {
        &self.queues
    }

    pub fn signal_dir(&self) -> &Path {
        &self.paths.signal_dir
    }

    fn set_peers(&self, peers: Vec<PeerInfo>) {
        *self.peers.write() = peers;
    }
}

/// Client half of the handshake. On success the server has assigned us an
/// address; the record stream (with the negotiated cipher) starts after.
pub async fn handshake(
    stream: &mut TunnelStream,
    encrypt: bool,
    hello: &HelloInfo,
) -> Result<Ipv4Addr> {
    stream
        .write_all(&[u8::from(encrypt)])
        .await
        .map_err(|e| Error::Handshake(format!("send encryption flag: {e}")))?;

    let hello_json = serde_json::to_vec(hello)
        .map_err(|e| Error::Handshake(format!("encode peer info: {e}")))?;
    write_frame(stream, &hello_json).await?;

    let addr_raw = read_frame(stream, MAX_ADDR_LEN).await?;
    let addr_text = std::str::from_utf8(&addr_raw)
        .map_err(|_| Error::Handshake("assigned address is not UTF-8".into()))?;
    let assigned = addr_text
        .parse::<Ipv4Addr>()
        .map_err(|_| Error::Handshake(format!("bad assigned address: {addr_text}")))?;

    tracing::info!(assigned = %assigned, encrypted = encrypt, "handshake complete");
    Ok(assigned)
}

/// One connected client session; drives the tunnel endpoint plus the IPC
/// surface and the signal watcher.
pub struct ClientSession {
    tun: Arc<dyn PacketIo>,
    stream: TunnelStream,
    key: Option<PresharedKey>,
    state: Arc<ClientState>,
    shutdown: Shutdown,
}

impl ClientSession {
    /// `key` enables per-record encryption; pass the same preference that
    /// was sent during the handshake.
    pub fn new(
        tun: Arc<dyn PacketIo>,
        stream: TunnelStream,
        key: Option<PresharedKey>,
        paths: ClientPaths,
    ) -> Self {
        let shutdown = Shutdown::new();
        let state = Arc::new(ClientState::new(shutdown.clone(), paths));
        Self {
            tun,
            stream,
            key,
            state,
            shutdown,
        }
    }

    pub fn state(&self) -> Arc<ClientState> {
        Arc::clone(&self.state)
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run until the tunnel fails or the shutdown signal trips.
    ///
    /// The IPC surface listens on `ipc_listener`; callers bind it so
    /// tests can use an ephemeral port.
    pub async fn run(self, ipc_listener: tokio::net::TcpListener) -> Result<()> {
        let Self {
            tun,
            stream,
            key,
            state,
            shutdown,
        } = self;

        let (read_half, write_half) = stream.into_split();

        let egress_stats = DirectionStats::new();
        let ingress_stats = DirectionStats::new();

        let records = RecordWriter::new(write_half, CLIENT_WRITER_CAPACITY, CLIENT_FLUSH_THRESHOLD)
            .with_stats(Arc::clone(&egress_stats));
        let writer = Arc::new(
            ChannelWriter::new(
                records,
                key.as_ref().map(|k| RecordCipher::new(k.as_bytes())),
            )
            .with_stats(Arc::clone(&egress_stats)),
        );
        let reader = ChannelReader::new(
            RecordReader::new(read_half),
            key.as_ref().map(|k| RecordCipher::new(k.as_bytes())),
        )
        .with_stats(Arc::clone(&ingress_stats));

        let (control_tx, control_rx) = mpsc::channel(64);

        let control_task = tokio::spawn(control_loop(control_rx, Arc::clone(&state)));

        let ipc_task = {
            let ipc_state = ipc::IpcState::new(Arc::clone(&state));
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = ipc::serve(ipc_listener, ipc_state, shutdown).await {
                    tracing::error!(error = %e, "IPC surface failed");
                }
            })
        };

        let watcher_task = tokio::spawn(signals::watch_outgoing(
            state.signal_dir().to_path_buf(),
            Arc::clone(&writer),
            shutdown.clone(),
        ));

        let endpoint = TunnelEndpoint::new(
            tun,
            reader,
            writer,
            egress_stats,
            ingress_stats,
            shutdown.clone(),
        );
        let result = endpoint.run(control_tx).await;

        shutdown.trigger();
        let _ = tokio::join!(control_task, ipc_task, watcher_task);

        result
    }
}

/// Apply control messages received over the tunnel.
async fn control_loop(mut control_rx: mpsc::Receiver<ControlMessage>, state: Arc<ClientState>) {
    while let Some(msg) = control_rx.recv().await {
        match msg {
            ControlMessage::PeerList(peers) => {
                tracing::info!(count = peers.len(), "peer directory updated");
                publish_peer_list(&state, &peers);
                state.set_peers(peers);
            }
            ControlMessage::Signal { addr, data } => {
                let peer = addr.map(|a| a.to_string()).unwrap_or_default();
                let extension = extension_for(&data);
                state.queues().push(&extension, SignalEnvelope { peer, data });
            }
            ControlMessage::Update(token) => {
                tracing::info!(token = %token, "update notification received");
                write_update_signal(&state.paths.update_signal_file, &token);
            }
            ControlMessage::Unknown(command) => {
                tracing::warn!(command = %command, "unknown control command ignored");
            }
        }
    }
}

/// Publish the directory to the well-known file for external UIs.
fn publish_peer_list(state: &ClientState, peers: &[PeerInfo]) {
    let path = &state.paths.peers_file;
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match serde_json::to_vec_pretty(peers) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                tracing::warn!(path = %path.display(), error = %e, "failed to write peer file");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialize peer list"),
    }
}

/// Write the one-line update token the supervisor acts on.
fn write_update_signal(path: &Path, token: &str) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(path, token) {
        tracing::warn!(path = %path.display(), error = %e, "failed to write update signal");
    }
}
