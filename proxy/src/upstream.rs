/// Pool-side transport
///
/// `PoolConnector` is the seam between a session and the network: the
/// server uses plain TCP, tests substitute in-memory duplex pipes.

use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::ProxyError;
use crate::metrics::prometheus as metrics;
use crate::registry::PoolPreset;
use crate::stratum::framer::{Frame, Framer};

const READ_CHUNK: usize = 8 * 1024;

#[async_trait]
pub trait PoolConnector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self, preset: &PoolPreset) -> io::Result<Self::Stream>;
}

/// Plain TCP, as pools expect (no TLS).
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl PoolConnector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, preset: &PoolPreset) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((preset.host.as_str(), preset.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Connect with a deadline. A timeout is reported like any other failure.
pub async fn connect_with_timeout<C: PoolConnector>(
    connector: &C,
    preset: &PoolPreset,
    timeout: Duration,
) -> Result<C::Stream, ProxyError> {
    match tokio::time::timeout(timeout, connector.connect(preset)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::Io(e)),
        Err(_) => Err(ProxyError::ConnectTimeout { target: preset.address(), timeout }),
    }
}

/// A live pool connection owned by one session.
pub struct Upstream<S> {
    stream: S,
    framer: Framer,
    pub preset: PoolPreset,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Upstream<S> {
    pub fn new(stream: S, preset: PoolPreset, max_line: usize) -> Self {
        metrics::inc_upstream_open();
        Self { stream, framer: Framer::new(max_line), preset }
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), ProxyError> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Next chunk from the pool. EOF is an error: pools never close cleanly
    /// mid-session.
    ///
    /// Cancel safe: `read_buf` consumes nothing if the future is dropped.
    pub async fn read_chunk(&mut self) -> Result<BytesMut, ProxyError> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let n = self.stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(ProxyError::UpstreamClosed);
        }
        Ok(buf)
    }

    pub fn reframe(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.framer.feed(chunk)
    }
}

impl<S> Drop for Upstream<S> {
    fn drop(&mut self) {
        metrics::dec_upstream_open();
    }
}
