//! The framed crypto channel: record framing plus optional per-record
//! AEAD, negotiated once at handshake.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use crate::crypto::RecordCipher;
use crate::error::Result;
use crate::protocol::framing::{RecordReader, RecordWriter};
use crate::tunnel::stats::DirectionStats;
use crate::types::Shutdown;

/// Interval of the background flusher bounding latency when traffic is
/// sparse; the threshold flush handles steady state.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Sending half of the channel. Shared behind an `Arc` by everything that
/// injects records for this direction.
pub struct ChannelWriter<W> {
    records: RecordWriter<W>,
    cipher: Option<RecordCipher>,
    stats: Option<Arc<DirectionStats>>,
}

impl<W: AsyncWrite + Unpin + Send> ChannelWriter<W> {
    pub fn new(records: RecordWriter<W>, cipher: Option<RecordCipher>) -> Self {
        Self {
            records,
            cipher,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<DirectionStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Whether this session negotiated encryption.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seal (when negotiated) and enqueue one payload as a record.
    pub async fn send(&self, plaintext: &[u8]) -> Result<()> {
        match &self.cipher {
            Some(cipher) => {
                let crypto_start = Instant::now();
                let wire = cipher.seal(plaintext)?;
                if let Some(stats) = &self.stats {
                    stats.add_crypto(crypto_start.elapsed());
                }
                self.records.send(&wire).await
            }
            None => self.records.send(plaintext).await,
        }
    }

    /// Flush unconditionally.
    pub async fn flush(&self) -> Result<()> {
        self.records.flush().await
    }

    /// Flush only if bytes are buffered.
    pub async fn flush_pending(&self) -> Result<bool> {
        self.records.flush_pending().await
    }
}

/// Receiving half of the channel.
pub struct ChannelReader<R> {
    records: RecordReader<R>,
    cipher: Option<RecordCipher>,
    stats: Option<Arc<DirectionStats>>,
}

impl<R: AsyncRead + Unpin> ChannelReader<R> {
    pub fn new(records: RecordReader<R>, cipher: Option<RecordCipher>) -> Self {
        Self {
            records,
            cipher,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<DirectionStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Receive one record and return its plaintext.
    ///
    /// A decryption failure is reported as a non-fatal [`crate::Error::Crypto`];
    /// the stream remains consistent and the next record can be read.
    /// Empty records decode to empty payloads without touching the cipher.
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        let read_start = Instant::now();
        let raw = self.records.read_record().await?;
        if let Some(stats) = &self.stats {
            stats.add_net_read(read_start.elapsed());
        }

        if raw.is_empty() {
            return Ok(Vec::new());
        }

        match &self.cipher {
            Some(cipher) => {
                let crypto_start = Instant::now();
                let plaintext = cipher.open(raw)?;
                if let Some(stats) = &self.stats {
                    stats.add_crypto(crypto_start.elapsed());
                }
                Ok(plaintext)
            }
            None => Ok(raw.to_vec()),
        }
    }
}

/// Spawn the 1 ms background flusher for a shared writer.
///
/// Exits when the shutdown signal trips or the underlying stream fails;
/// a failed flush surfaces again on the next `send`.
pub fn spawn_flusher<W>(writer: Arc<ChannelWriter<W>>, shutdown: Shutdown) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while shutdown.is_active() {
            interval.tick().await;
            if writer.flush_pending().await.is_err() {
                break;
            }
        }
    })
}
