//! Core types used throughout Veles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A connected VPN peer as seen in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Client-reported hostname.
    pub hostname: String,
    /// Assigned address inside the VPN subnet; the peer's identity.
    pub vpn_address: String,
    /// Public address the connection arrived from.
    pub public_ip: String,
    /// RFC 3339 timestamp of registration.
    pub connected_at: String,
    /// Client-reported operating system tag.
    pub os: String,
}

/// What a client announces about itself during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloInfo {
    pub hostname: String,
    pub os: String,
}

impl HelloInfo {
    /// Hello for the local machine.
    pub fn local() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(|| {
                std::process::Command::new("hostname")
                    .output()
                    .ok()
                    .and_then(|o| String::from_utf8(o.stdout).ok())
                    .map(|s| s.trim().to_string())
                    .filter(|h| !h.is_empty())
            })
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            hostname,
            os: std::env::consts::OS.to_string(),
        }
    }
}

/// Cooperative shutdown signal shared by every task of a session.
///
/// Tasks observe it between iterations; nothing is interrupted mid-syscall.
#[derive(Debug, Clone)]
pub struct Shutdown {
    enabled: Arc<AtomicBool>,
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
            tx,
        }
    }

    /// Whether the session is still live.
    pub fn is_active(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Trip the signal; idempotent.
    pub fn trigger(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    /// Subscribe for use in `tokio::select!` arms.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Future that resolves once the signal trips.
    pub async fn triggered(&self) {
        // Subscribe before the liveness check: trigger() clears the flag
        // before sending, so this ordering cannot miss the wakeup.
        let mut rx = self.subscribe();
        if !self.is_active() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
