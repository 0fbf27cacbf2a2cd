//! Peek-and-replay connection wrapper.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tonic::transport::server::Connected;

/// Sub-server a connection was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionClass {
    Rpc,
    Gateway,
    Http,
}

impl ConnectionClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rpc => "rpc",
            Self::Gateway => "gateway",
            Self::Http => "http",
        }
    }
}

/// A classified connection.
///
/// Reads first replay the bytes consumed during classification, then
/// continue from the socket, so the sub-server sees the original stream.
#[derive(Debug)]
pub struct MuxedStream {
    prefix: Bytes,
    inner: TcpStream,
    remote_addr: SocketAddr,
    class: ConnectionClass,
}

impl MuxedStream {
    #[must_use]
    pub fn new(
        inner: TcpStream,
        prefix: Bytes,
        remote_addr: SocketAddr,
        class: ConnectionClass,
    ) -> Self {
        Self {
            prefix,
            inner,
            remote_addr,
            class,
        }
    }

    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[must_use]
    pub fn class(&self) -> ConnectionClass {
        self.class
    }

    /// Bytes not yet replayed.
    #[must_use]
    pub fn pending_prefix(&self) -> usize {
        self.prefix.len()
    }
}

impl AsyncRead for MuxedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Connection info exposed to RPC handlers through request extensions.
#[derive(Debug, Clone, Copy)]
pub struct MuxConnectInfo {
    pub remote_addr: SocketAddr,
    pub class: ConnectionClass,
}

impl Connected for MuxedStream {
    type ConnectInfo = MuxConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        MuxConnectInfo {
            remote_addr: self.remote_addr,
            class: self.class,
        }
    }
}
