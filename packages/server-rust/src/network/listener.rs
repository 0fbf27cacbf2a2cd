//! Sub-listeners fed by the demultiplexer.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;

use futures_util::stream::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::stream::MuxedStream;

/// Capacity of each sub-listener's hand-off queue.
const BACKLOG: usize = 128;

/// Creates a connected sender/sub-listener pair.
#[must_use]
pub fn sub_listener(local_addr: SocketAddr) -> (mpsc::Sender<MuxedStream>, SubListener) {
    let (tx, rx) = mpsc::channel(BACKLOG);
    (tx, SubListener { rx, local_addr })
}

/// The receiving end of a demultiplexer route.
///
/// Looks like a listener to the HTTP sub-servers and like an incoming
/// connection stream to the RPC runtime.
#[derive(Debug)]
pub struct SubListener {
    rx: mpsc::Receiver<MuxedStream>,
    local_addr: SocketAddr,
}

impl SubListener {
    /// Converts into the `incoming` stream taken by the RPC runtime.
    ///
    /// The stream ends once the demultiplexer drops its sender.
    pub fn into_incoming(self) -> impl Stream<Item = Result<MuxedStream, Infallible>> {
        ReceiverStream::new(self.rx).map(Ok)
    }
}

impl axum::serve::Listener for SubListener {
    type Io = MuxedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.rx.recv().await {
            Some(stream) => {
                let addr = stream.remote_addr();
                (stream, addr)
            }
            // The demultiplexer is gone; the server stops through its
            // graceful-shutdown signal, never through accept.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}
