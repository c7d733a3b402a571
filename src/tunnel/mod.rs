//! The tunnel endpoint: bidirectional pump between a TUN device and one
//! framed crypto channel.
//!
//! The egress pump reads packets from the TUN and sends them as records;
//! the ingress pump receives records, hands control messages to the
//! session and writes everything else to the TUN. Flow control is entirely
//! TCP's; there is no per-packet acknowledgement.

pub mod stats;

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::channel::{spawn_flusher, ChannelReader, ChannelWriter};
use crate::protocol::control::ControlMessage;
use crate::tun::PacketIo;
use crate::types::Shutdown;
use crate::MTU;
use stats::{spawn_reporter, DirectionStats};

/// TUN → channel. Runs until shutdown or a fatal error.
pub async fn egress_pump<W>(
    tun: Arc<dyn PacketIo>,
    writer: Arc<ChannelWriter<W>>,
    stats: Arc<DirectionStats>,
    shutdown: Shutdown,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; MTU];

    loop {
        if !shutdown.is_active() {
            return Ok(());
        }

        let read_start = Instant::now();
        let n = tokio::select! {
            () = shutdown.triggered() => return Ok(()),
            result = tun.recv(&mut buf) => result?,
        };
        stats.add_tun(read_start.elapsed());

        if n == 0 {
            continue;
        }

        writer.send(&buf[..n]).await?;
        stats.add_packet(n as u64);
    }
}

/// Channel → TUN, with the control/data partition: a plaintext beginning
/// with `CTRL:` goes to the control sink and never to the TUN.
///
/// Per-record decryption failures are logged and skipped; framing and I/O
/// errors are fatal for the session.
pub async fn ingress_pump<R>(
    tun: Arc<dyn PacketIo>,
    mut reader: ChannelReader<R>,
    control_tx: mpsc::Sender<ControlMessage>,
    stats: Arc<DirectionStats>,
    shutdown: Shutdown,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        if !shutdown.is_active() {
            return Ok(());
        }

        let plaintext = tokio::select! {
            () = shutdown.triggered() => return Ok(()),
            result = reader.recv() => match result {
                Ok(plaintext) => plaintext,
                Err(e) if e.is_session_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecryptable record");
                    continue;
                }
            },
        };

        if plaintext.is_empty() {
            continue;
        }

        if ControlMessage::is_control(&plaintext) {
            if let Some(msg) = ControlMessage::parse(&plaintext) {
                if control_tx.send(msg).await.is_err() {
                    // Control consumer gone; the session is winding down.
                    return Ok(());
                }
            }
            continue;
        }

        let write_start = Instant::now();
        let n = tun.send(&plaintext).await?;
        stats.add_tun(write_start.elapsed());
        stats.add_packet(n as u64);
    }
}

fn flatten(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(inner) => inner,
        Err(join_err) => {
            tracing::error!(error = %join_err, "pump task panicked");
            Ok(())
        }
    }
}

/// One TUN device bound to one framed crypto channel.
pub struct TunnelEndpoint<R, W> {
    tun: Arc<dyn PacketIo>,
    reader: ChannelReader<R>,
    writer: Arc<ChannelWriter<W>>,
    egress_stats: Arc<DirectionStats>,
    ingress_stats: Arc<DirectionStats>,
    shutdown: Shutdown,
}

impl<R, W> TunnelEndpoint<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    pub fn new(
        tun: Arc<dyn PacketIo>,
        reader: ChannelReader<R>,
        writer: Arc<ChannelWriter<W>>,
        egress_stats: Arc<DirectionStats>,
        ingress_stats: Arc<DirectionStats>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            tun,
            reader,
            writer,
            egress_stats,
            ingress_stats,
            shutdown,
        }
    }

    /// Drive both pumps (plus the background flusher and stats reporters)
    /// until either direction fails or shutdown trips.
    ///
    /// Returns the first fatal error, if any. The channel is released on
    /// return; tearing down the kernel interface is the caller's concern.
    pub async fn run(self, control_tx: mpsc::Sender<ControlMessage>) -> Result<()> {
        let Self {
            tun,
            reader,
            writer,
            egress_stats,
            ingress_stats,
            shutdown,
        } = self;

        let flusher = spawn_flusher(Arc::clone(&writer), shutdown.clone());
        let egress_reporter =
            spawn_reporter("egress", Arc::clone(&egress_stats), shutdown.clone());
        let ingress_reporter =
            spawn_reporter("ingress", Arc::clone(&ingress_stats), shutdown.clone());

        let mut egress = tokio::spawn(egress_pump(
            Arc::clone(&tun),
            Arc::clone(&writer),
            egress_stats,
            shutdown.clone(),
        ));
        let mut ingress = tokio::spawn(ingress_pump(
            tun,
            reader,
            control_tx,
            ingress_stats,
            shutdown.clone(),
        ));

        // First pump to finish decides the outcome; the shutdown signal
        // reels in the other, the flusher and both reporters.
        let (first, second) = tokio::select! {
            res = &mut egress => {
                shutdown.trigger();
                (res, ingress.await)
            }
            res = &mut ingress => {
                shutdown.trigger();
                (res, egress.await)
            }
        };
        let _ = tokio::join!(flusher, egress_reporter, ingress_reporter);

        flatten(first)?;
        flatten(second)
    }
}
