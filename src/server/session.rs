//! Per-client server session: handshake, registration and the ingress
//! direction. The egress direction is centralized in the TUN router.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::crypto::{PresharedKey, RecordCipher};
use crate::error::{Error, Result};
use crate::protocol::channel::{spawn_flusher, ChannelReader, ChannelWriter};
use crate::protocol::control::ControlMessage;
use crate::protocol::framing::{
    read_frame, RecordReader, RecordWriter, SERVER_FLUSH_THRESHOLD, SERVER_WRITER_CAPACITY,
};
use crate::server::registry::PeerRegistry;
use crate::server::router::PeerDispatcher;
use crate::transport::TunnelStream;
use crate::tun::PacketIo;
use crate::tunnel::stats::{spawn_reporter, DirectionStats};
use crate::tunnel::ingress_pump;
use crate::types::{HelloInfo, Shutdown};

/// Largest acceptable hello frame.
const MAX_HELLO_LEN: usize = 4096;

/// Serve one accepted connection to completion.
///
/// Any fatal error tears this session down — deregistering it (which
/// broadcasts the new directory) and closing the channel — while the
/// accept loop continues serving others.
pub async fn handle_connection(
    mut stream: TunnelStream,
    registry: Arc<PeerRegistry>,
    tun: Arc<dyn PacketIo>,
    key: PresharedKey,
    server_shutdown: Shutdown,
) -> Result<()> {
    let public_ip = stream.peer_addr()?.ip().to_string();
    tracing::info!(peer = %public_ip, "client connected");

    // Encryption preference byte, then the hello frame. Neither is
    // encrypted; the record cipher starts after the handshake.
    let mut flag = [0u8; 1];
    stream
        .read_exact(&mut flag)
        .await
        .map_err(|e| Error::Handshake(format!("read encryption flag: {e}")))?;
    let encrypted = flag[0] == 1;

    let hello_raw = read_frame(&mut stream, MAX_HELLO_LEN).await?;
    let hello: HelloInfo = serde_json::from_slice(&hello_raw)
        .map_err(|e| Error::Handshake(format!("malformed peer info: {e}")))?;

    tracing::debug!(
        hostname = %hello.hostname,
        os = %hello.os,
        encrypted,
        "handshake received"
    );

    // Allocate before replying; the counter is monotone, so the address
    // is unique even if this session dies before registering.
    let vpn_addr = registry.allocate()?;

    let (read_half, write_half) = stream.into_split();

    let egress_stats = DirectionStats::new();
    let ingress_stats = DirectionStats::new();

    let records =
        RecordWriter::new(write_half, SERVER_WRITER_CAPACITY, SERVER_FLUSH_THRESHOLD)
            .with_stats(Arc::clone(&egress_stats));

    // The address reply is a raw frame, sent before the cipher engages so
    // registration (and its broadcast) can never race ahead of it.
    records.send(vpn_addr.to_string().as_bytes()).await?;
    records.flush().await?;

    let cipher = encrypted.then(|| RecordCipher::new(key.as_bytes()));
    let writer = Arc::new(
        ChannelWriter::new(records, cipher).with_stats(Arc::clone(&egress_stats)),
    );
    let reader = ChannelReader::new(
        RecordReader::new(read_half),
        encrypted.then(|| RecordCipher::new(key.as_bytes())),
    )
    .with_stats(Arc::clone(&ingress_stats));

    let handle = registry.register(vpn_addr, &hello, &public_ip, Arc::clone(&writer));

    let shutdown = Shutdown::new();

    // Server-wide shutdown reels in every session.
    {
        let server_shutdown = server_shutdown.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            server_shutdown.triggered().await;
            shutdown.trigger();
        });
    }

    let flusher = spawn_flusher(Arc::clone(&writer), shutdown.clone());
    let ingress_reporter =
        spawn_reporter("server-ingress", Arc::clone(&ingress_stats), shutdown.clone());
    // Egress counters accumulate from the router and the control
    // broadcaster through this session's shared writer.
    let egress_reporter =
        spawn_reporter("server-egress", Arc::clone(&egress_stats), shutdown.clone());

    // Control messages coming up from the ingress pump: the only
    // recognized client→server command is targeted signaling.
    let (control_tx, control_rx) = mpsc::channel(64);
    let control_task = tokio::spawn(control_loop(
        control_rx,
        Arc::clone(&registry),
        vpn_addr,
    ));

    // Peer-destined packets go straight to the target session; only
    // Internet-bound traffic reaches the kernel through the TUN.
    let dispatcher: Arc<dyn PacketIo> =
        Arc::new(PeerDispatcher::new(tun, Arc::clone(&registry)));

    let result =
        ingress_pump(dispatcher, reader, control_tx, ingress_stats, shutdown.clone()).await;

    shutdown.trigger();
    registry.deregister(handle.vpn_addr);
    let _ = tokio::join!(flusher, ingress_reporter, egress_reporter, control_task);

    match &result {
        Ok(()) => tracing::info!(peer = %public_ip, addr = %vpn_addr, "client disconnected"),
        Err(e) => {
            tracing::info!(peer = %public_ip, addr = %vpn_addr, error = %e, "session ended")
        }
    }
    result
}

/// Consume control messages from one session's ingress direction.
async fn control_loop(
    mut control_rx: mpsc::Receiver<ControlMessage>,
    registry: Arc<PeerRegistry>,
    sender_addr: std::net::Ipv4Addr,
) {
    while let Some(msg) = control_rx.recv().await {
        match msg {
            ControlMessage::Signal {
                addr: Some(target),
                data,
            } => {
                // One-hop peer addressing: swap the target for the sender
                // so the receiving extension knows who is signaling.
                tracing::debug!(from = %sender_addr, to = %target, "forwarding signal");
                let forward = ControlMessage::Signal {
                    addr: Some(sender_addr),
                    data,
                };
                if let Err(e) = registry.send_to_peer(target, &forward).await {
                    tracing::warn!(to = %target, error = %e, "signal forward failed");
                }
            }
            ControlMessage::Signal { addr: None, .. } => {
                tracing::warn!(from = %sender_addr, "signal without target dropped");
            }
            other => {
                tracing::debug!(from = %sender_addr, msg = ?other, "ignoring control message");
            }
        }
    }
}
