//! Length-prefixed record framing.
//!
//! One record on the wire is `u32_be length || payload`. The reader pulls
//! exactly four bytes, then exactly `length` bytes, through a buffered
//! reader that coalesces kernel reads. A length above [`MAX_RECORD_LEN`]
//! is a fatal protocol error.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::tunnel::stats::DirectionStats;
use crate::MAX_RECORD_LEN;

/// Writer buffer capacity on the client→server direction (latency-sensitive).
pub const CLIENT_WRITER_CAPACITY: usize = 4 * 1024;

/// Flush threshold on the client→server direction.
pub const CLIENT_FLUSH_THRESHOLD: usize = 2 * 1024;

/// Writer buffer capacity on the server→client direction (bulk download).
pub const SERVER_WRITER_CAPACITY: usize = 128 * 1024;

/// Flush threshold on the server→client direction.
pub const SERVER_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Reader for length-prefixed records.
pub struct RecordReader<R> {
    inner: BufReader<R>,
    // Reused across records; sized for the largest legal payload.
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::with_capacity(64 * 1024, inner),
            buf: vec![0u8; MAX_RECORD_LEN],
        }
    }

    /// Read exactly one record and return a view of its payload.
    ///
    /// A zero-length record decodes as an empty payload, not an error.
    pub async fn read_record(&mut self) -> Result<&[u8]> {
        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf).await.map_err(map_eof)?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_RECORD_LEN {
            return Err(Error::OversizeRecord {
                len,
                max: MAX_RECORD_LEN,
            });
        }

        self.inner
            .read_exact(&mut self.buf[..len])
            .await
            .map_err(map_eof)?;

        Ok(&self.buf[..len])
    }
}

fn map_eof(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

/// Mutex-serialized buffered record writer.
///
/// The lock spans `length || payload` of one record plus the threshold
/// flush, so records from concurrent senders (the egress pump, the control
/// broadcaster, the router) never interleave.
pub struct RecordWriter<W> {
    inner: Mutex<BufWriter<W>>,
    flush_threshold: usize,
    stats: Option<Arc<DirectionStats>>,
}

impl<W: AsyncWrite + Unpin + Send> RecordWriter<W> {
    pub fn new(inner: W, capacity: usize, flush_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(BufWriter::with_capacity(capacity, inner)),
            flush_threshold,
            stats: None,
        }
    }

    /// Attach a stats sink for lock-wait / write / flush timings.
    pub fn with_stats(mut self, stats: Arc<DirectionStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Append one record; flushes when the buffer crosses the threshold.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let lock_start = Instant::now();
        let mut writer = self.inner.lock().await;
        if let Some(stats) = &self.stats {
            stats.add_lock_wait(lock_start.elapsed());
        }

        let write_start = Instant::now();
        writer
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        writer.write_all(payload).await?;
        if let Some(stats) = &self.stats {
            stats.add_net_write(write_start.elapsed());
        }

        if writer.buffer().len() >= self.flush_threshold {
            let flush_start = Instant::now();
            writer.flush().await?;
            if let Some(stats) = &self.stats {
                stats.add_flush(flush_start.elapsed());
                stats.add_flush_count();
            }
        }

        Ok(())
    }

    /// Flush unconditionally.
    pub async fn flush(&self) -> Result<()> {
        let mut writer = self.inner.lock().await;
        writer.flush().await?;
        Ok(())
    }

    /// Flush only if bytes are buffered; returns whether a flush happened.
    pub async fn flush_pending(&self) -> Result<bool> {
        let mut writer = self.inner.lock().await;
        if writer.buffer().is_empty() {
            return Ok(false);
        }
        writer.flush().await?;
        if let Some(stats) = &self.stats {
            stats.add_flush_count();
        }
        Ok(true)
    }
}

/// Write a handshake frame (`u32_be len || bytes`). Handshake frames are
/// never encrypted and bypass the record writer's buffering.
pub async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> Result<()> {
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a handshake frame with a caller-supplied length cap.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S, max_len: usize) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(map_eof)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(Error::Handshake(format!(
            "frame length {len} exceeds {max_len}"
        )));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.map_err(map_eof)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_RECORD_LEN;

    #[tokio::test]
    async fn record_roundtrip() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let writer = RecordWriter::new(client, 4096, 2048);
        let mut reader = RecordReader::new(server);

        writer.send(b"first").await.unwrap();
        writer.send(b"second record").await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(reader.read_record().await.unwrap(), b"first");
        assert_eq!(reader.read_record().await.unwrap(), b"second record");
    }

    #[tokio::test]
    async fn framing_produces_exactly_four_plus_len_bytes() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let writer = RecordWriter::new(client, 4096, 2048);

        writer.send(b"abc").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire.len(), 4 + 3);
        assert_eq!(&wire[..4], &3u32.to_be_bytes());
        assert_eq!(&wire[4..], b"abc");
    }

    #[tokio::test]
    async fn zero_length_record_is_empty_payload() {
        let (client, server) = tokio::io::duplex(1024);
        let writer = RecordWriter::new(client, 4096, 2048);
        let mut reader = RecordReader::new(server);

        writer.send(b"").await.unwrap();
        writer.send(b"after").await.unwrap();
        writer.flush().await.unwrap();

        assert!(reader.read_record().await.unwrap().is_empty());
        assert_eq!(reader.read_record().await.unwrap(), b"after");
    }

    #[tokio::test]
    async fn max_record_accepted_one_past_rejected() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut reader = RecordReader::new(server);

        let payload = vec![0u8; MAX_RECORD_LEN];
        write_frame(&mut client, &payload).await.unwrap();
        assert_eq!(reader.read_record().await.unwrap().len(), MAX_RECORD_LEN);

        // Hand-write an oversize length field; the reader must refuse
        // before consuming any payload bytes.
        client
            .write_all(&((MAX_RECORD_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        client.flush().await.unwrap();

        match reader.read_record().await {
            Err(Error::OversizeRecord { len, max }) => {
                assert_eq!(len, MAX_RECORD_LEN + 1);
                assert_eq!(max, MAX_RECORD_LEN);
            }
            other => panic!("expected OversizeRecord, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn absurd_length_field_is_fatal() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = RecordReader::new(server);

        client
            .write_all(&0x7FFF_FFFFu32.to_be_bytes())
            .await
            .unwrap();
        client.flush().await.unwrap();

        assert!(matches!(
            reader.read_record().await,
            Err(Error::OversizeRecord { .. })
        ));
    }

    #[tokio::test]
    async fn eof_mid_record_is_connection_closed() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut reader = RecordReader::new(server);

        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"short").await.unwrap();
        drop(client);

        assert!(matches!(
            reader.read_record().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn threshold_flush_makes_records_visible() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        // Threshold of 1 byte: every record flushes immediately.
        let writer = RecordWriter::new(client, 4096, 1);
        let mut reader = RecordReader::new(server);

        writer.send(b"no explicit flush").await.unwrap();
        assert_eq!(reader.read_record().await.unwrap(), b"no explicit flush");
    }

    #[tokio::test]
    async fn handshake_frame_roundtrip_and_cap() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_frame(&mut client, b"{\"hostname\":\"x\"}").await.unwrap();
        let frame = read_frame(&mut server, 4096).await.unwrap();
        assert_eq!(frame, b"{\"hostname\":\"x\"}");

        write_frame(&mut client, &vec![0u8; 128]).await.unwrap();
        assert!(read_frame(&mut server, 64).await.is_err());
    }
}
