//! Tunnel transport: TCP with tuned sockets, optionally wrapped in TLS.

pub mod tls;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Socket buffer size both ways; sized for high-throughput tunnels.
pub const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// One tunnel connection, plain or TLS-wrapped.
///
/// The TLS layer is obfuscation (the flow resembles HTTPS), not
/// authentication; the pre-shared record key is the authenticator.
pub enum TunnelStream {
    Plain(TcpStream),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

/// Read half of a split tunnel stream.
pub type StreamReader = ReadHalf<TunnelStream>;

/// Write half of a split tunnel stream.
pub type StreamWriter = WriteHalf<TunnelStream>;

impl TunnelStream {
    /// Split into read and write halves for the two pumps.
    pub fn into_split(self) -> (StreamReader, StreamWriter) {
        tokio::io::split(self)
    }

    /// Public address of the remote end, through any TLS wrapping.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let tcp = match self {
            Self::Plain(s) => s,
            Self::ClientTls(s) => s.get_ref().0,
            Self::ServerTls(s) => s.get_ref().0,
        };
        tcp.peer_addr().map_err(Error::Io)
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Self::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Self::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Self::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Self::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Tune a tunnel socket: 1 MiB buffers each way, Nagle disabled.
pub fn tune_socket(stream: &TcpStream) -> Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE)
        .map_err(Error::Io)?;
    sock.set_send_buffer_size(SOCKET_BUFFER_SIZE)
        .map_err(Error::Io)?;
    sock.set_nodelay(true).map_err(Error::Io)?;
    tracing::debug!("socket tuned: 1MiB buffers, NODELAY");
    Ok(())
}

/// Dial the server, tune the socket and optionally wrap in TLS.
pub async fn dial(server_addr: &str, use_tls: bool) -> Result<TunnelStream> {
    let tcp = TcpStream::connect(server_addr)
        .await
        .map_err(|e| Error::Handshake(format!("connect to {server_addr}: {e}")))?;
    tune_socket(&tcp)?;

    if use_tls {
        let host = server_addr
            .rsplit_once(':')
            .map_or(server_addr, |(host, _)| host);
        let stream = tls::connect(host, tcp).await?;
        tracing::info!(server = server_addr, "connected with TLS wrapper");
        Ok(TunnelStream::ClientTls(Box::new(stream)))
    } else {
        tracing::info!(server = server_addr, "connected");
        Ok(TunnelStream::Plain(tcp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn plain_stream_split_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = TunnelStream::Plain(stream);
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut stream = dial(&addr.to_string(), false).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn peer_addr_resolves_through_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let stream = dial(&addr.to_string(), false).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        drop(accept.await.unwrap());
    }
}
