//! Transport abstraction
//!
//! A connection never opens sockets itself. It asks a [`TransportProvider`] for a
//! [`Channel`] and owns it from then on: reads are data events, a zero-length read is
//! the remote close, an I/O error is the error event and `shutdown()` ends the stream.

use super::tls::{parse_server_name, TlsConfig};
use crate::Result;
use futures::future::BoxFuture;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Byte stream handed out by a transport provider
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Channel for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Owned, type-erased channel
pub type BoxChannel = Box<dyn Channel>;

/// Source of channels for connections.
///
/// Shared by every connection of a pool as `Arc<dyn TransportProvider>`.
pub trait TransportProvider: Send + Sync + 'static {
    /// Open a plain channel to `host:port`
    fn open_channel<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Result<BoxChannel>>;

    /// Open a secure channel to `host:port`
    fn open_secure_channel<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        tls: &'a TlsConfig,
    ) -> BoxFuture<'a, Result<BoxChannel>>;
}

/// Default provider: tokio TCP, rustls for secure channels
#[derive(Debug, Clone)]
pub struct TcpProvider {
    nodelay: bool,
}

impl Default for TcpProvider {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl TcpProvider {
    /// Set `TCP_NODELAY` on new sockets (default: on)
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }
}

impl TransportProvider for TcpProvider {
    fn open_channel<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Result<BoxChannel>> {
        Box::pin(async move {
            let stream = self.connect_tcp(host, port).await?;
            Ok(Box::new(Transport::Plain(stream)) as BoxChannel)
        })
    }

    fn open_secure_channel<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        tls: &'a TlsConfig,
    ) -> BoxFuture<'a, Result<BoxChannel>> {
        Box::pin(async move {
            // Reject a bad SNI name before touching the network
            let server_name = parse_server_name(host)?;
            let stream = self.connect_tcp(host, port).await?;

            let connector = tokio_rustls::TlsConnector::from(tls.client_config());
            let tls_stream = connector.connect(server_name, stream).await?;

            Ok(Box::new(Transport::Tls(Box::new(tls_stream))) as BoxChannel)
        })
    }
}

/// TCP stream: plain or TLS-encrypted
pub enum Transport {
    /// Plain TCP connection
    Plain(TcpStream),
    /// TLS-encrypted TCP connection
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    /// Whether the stream is encrypted
    pub fn is_secure(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(_) => f.write_str("Transport::Plain(TcpStream)"),
            Transport::Tls(_) => f.write_str("Transport::Tls(TlsStream)"),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
