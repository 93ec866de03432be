//! Socket Transport
//!
//! The connection manager never opens sockets itself; it asks a [`Connector`]
//! so that tests can substitute in-memory streams.

use crate::codec::{Frame, HEADER_LEN};
use crate::error::PtpIpError;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Opens byte streams to a camera
pub trait Connector: Send + Sync + 'static {
    /// Stream type produced by this connector
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static;

    /// Connect to `addr`, failing with `TimedOut` after `timeout`
    fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// TCP connector used against real cameras
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
        debug!("TCP connect to {} (timeout {:?})", addr, timeout);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Write one frame and flush it
pub(crate) async fn write_frame<S>(stream: &mut S, frame: &Frame) -> Result<(), PtpIpError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&frame.encode()).await?;
    stream.flush().await?;
    Ok(())
}

/// Read exactly one frame
pub(crate) async fn read_frame<S>(stream: &mut S) -> Result<Frame, PtpIpError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let (packet_type, payload_len) = Frame::parse_header(&header)?;

    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;
    Ok(Frame::new(packet_type, payload))
}
