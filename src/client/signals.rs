//! Extension signaling plumbing: per-extension inbound queues and the
//! outgoing-signal file watcher.
//!
//! Extensions without an HTTP client drop a file at a well-known path;
//! the watcher reads it once, sends it over the tunnel and deletes it —
//! a polling filesystem protocol with at-least-once semantics and
//! deletion as the acknowledgement.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWrite;

use crate::protocol::channel::ChannelWriter;
use crate::protocol::control::ControlMessage;
use crate::types::Shutdown;

/// Poll interval of the outgoing-signal watcher.
pub const WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Filename prefix of outgoing signal drops within the signal directory.
pub const OUT_PREFIX: &str = "out-";

/// Extension name used when a signal blob does not carry a discriminator.
pub const DEFAULT_EXTENSION: &str = "video";

/// One queued inbound signal.
#[derive(Debug, Clone, Serialize)]
pub struct SignalEnvelope {
    /// VPN address of the originating peer.
    pub peer: String,
    /// The signal blob, byte-identical to what the sender posted.
    pub data: String,
}

/// Per-extension FIFO queues, drained on poll. Bounded only by memory;
/// nothing persists.
#[derive(Debug, Default)]
pub struct SignalQueues {
    inner: Mutex<HashMap<String, Vec<SignalEnvelope>>>,
}

impl SignalQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a signal for an extension.
    pub fn push(&self, extension: &str, envelope: SignalEnvelope) {
        tracing::debug!(extension, peer = %envelope.peer, "queued inbound signal");
        self.inner
            .lock()
            .entry(extension.to_string())
            .or_default()
            .push(envelope);
    }

    /// Return and clear an extension's queue.
    pub fn drain(&self, extension: &str) -> Vec<SignalEnvelope> {
        self.inner.lock().remove(extension).unwrap_or_default()
    }
}

/// Which extension owns a signal blob: the JSON `extension` field, or the
/// default when absent or unparsable.
pub fn extension_for(data: &str) -> String {
    serde_json::from_str::<serde_json::Value>(data)
        .ok()
        .and_then(|v| v.get("extension").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// Path of the outgoing drop file for a peer.
pub fn out_path(signal_dir: &Path, peer: &str) -> PathBuf {
    signal_dir.join(format!("{OUT_PREFIX}{peer}"))
}

/// Watch the signal directory and forward each drop over the tunnel.
///
/// Each file is read once, wrapped as a targeted signal, sent and deleted.
/// Processed paths are remembered until the file is actually gone, so a
/// slow deletion cannot cause a double send.
pub async fn watch_outgoing<W>(
    signal_dir: PathBuf,
    writer: Arc<ChannelWriter<W>>,
    shutdown: Shutdown,
) where
    W: AsyncWrite + Unpin + Send,
{
    if let Err(e) = std::fs::create_dir_all(&signal_dir) {
        tracing::warn!(dir = %signal_dir.display(), error = %e, "signal dir unavailable");
    }

    let mut processed: HashSet<PathBuf> = HashSet::new();
    let mut interval = tokio::time::interval(WATCH_INTERVAL);

    loop {
        tokio::select! {
            () = shutdown.triggered() => return,
            _ = interval.tick() => {}
        }
        if !shutdown.is_active() {
            return;
        }

        processed.retain(|path| path.exists());

        let Ok(entries) = std::fs::read_dir(&signal_dir) else {
            continue;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(OUT_PREFIX) || processed.contains(&path) {
                continue;
            }

            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            if content.is_empty() {
                continue;
            }

            // Drop files carry `<peer>:<blob>`.
            let Some((peer, data)) = content.split_once(':') else {
                tracing::warn!(file = %path.display(), "malformed signal drop removed");
                let _ = std::fs::remove_file(&path);
                continue;
            };
            let Ok(target) = peer.parse::<Ipv4Addr>() else {
                tracing::warn!(file = %path.display(), peer, "bad peer address in signal drop");
                let _ = std::fs::remove_file(&path);
                continue;
            };

            let msg = ControlMessage::Signal {
                addr: Some(target),
                data: data.to_string(),
            };
            match writer.send(&msg.encode()).await {
                Ok(()) => {
                    tracing::debug!(to = %target, "outgoing signal sent");
                    processed.insert(path.clone());
                    let _ = std::fs::remove_file(&path);
                }
                Err(e) => {
                    // Leave the file for a retry; the tunnel may be mid-teardown.
                    tracing::warn!(to = %target, error = %e, "outgoing signal send failed");
                }
            }
        }
    }
}
