//! Per-protocol virtual listeners.
//!
//! Each registered matcher gets a bounded queue. The multiplexer's
//! classification tasks push connections in; the protocol server pulls them
//! out with [`VirtualListener::accept`] exactly as it would from a socket.

use crate::mux::error::MuxError;
use crate::mux::sniff::SniffedStream;
use crate::util::{ConnectionId, ShutdownSignal};
use futures::Stream;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// A classified connection, with its sniffed bytes still unread.
#[derive(Debug)]
pub struct Connection {
    stream: SniffedStream<TcpStream>,
    info: ConnectionInfo,
}

/// Addressing and routing details of a [`Connection`].
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub protocol: Arc<str>,
}

impl Connection {
    pub(crate) fn new(stream: SniffedStream<TcpStream>, info: ConnectionInfo) -> Self {
        Self { stream, info }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.info.peer_addr
    }

    pub fn protocol(&self) -> &str {
        &self.info.protocol
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl tonic::transport::server::Connected for Connection {
    type ConnectInfo = ConnectionInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info.clone()
    }
}

/// Create a connected sender/listener pair for one protocol.
pub(crate) fn channel(
    protocol: Arc<str>,
    capacity: usize,
    local_addr: SocketAddr,
) -> (VirtualSender, VirtualListener) {
    let (tx, rx) = mpsc::channel(capacity);
    let closed = ShutdownSignal::new();

    let sender = VirtualSender {
        sender: tx,
        closed: closed.clone(),
    };
    let listener = VirtualListener {
        protocol,
        receiver: rx,
        closed,
        local_addr,
    };
    (sender, listener)
}

/// Producer half held by the multiplexer.
#[derive(Clone, Debug)]
pub(crate) struct VirtualSender {
    sender: mpsc::Sender<Connection>,
    closed: ShutdownSignal,
}

impl VirtualSender {
    /// Queue a connection, waiting for room when the queue is full.
    ///
    /// Fails with [`MuxError::Closed`] if the listener is closed first; the
    /// connection is dropped in that case.
    pub(crate) async fn deliver(&self, conn: Connection) -> Result<(), MuxError> {
        if self.closed.is_shutdown() {
            return Err(MuxError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closed.wait() => Err(MuxError::Closed),
            sent = self.sender.send(conn) => sent.map_err(|_| MuxError::Closed),
        }
    }

    pub(crate) fn close_signal(&self) -> ShutdownSignal {
        self.closed.clone()
    }
}

/// A listener fed by the multiplexer rather than by the kernel.
#[derive(Debug)]
pub struct VirtualListener {
    protocol: Arc<str>,
    receiver: mpsc::Receiver<Connection>,
    closed: ShutdownSignal,
    local_addr: SocketAddr,
}

impl VirtualListener {
    /// Wait for the next connection classified for this protocol.
    ///
    /// Returns [`MuxError::Closed`] once the listener or its mux is closed.
    pub async fn accept(&mut self) -> Result<Connection, MuxError> {
        if self.closed.is_shutdown() {
            return Err(MuxError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closed.wait() => Err(MuxError::Closed),
            conn = self.receiver.recv() => conn.ok_or(MuxError::Closed),
        }
    }

    /// Close this listener. Pending and future `accept` calls fail.
    pub fn close(&self) {
        self.closed.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_shutdown()
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Address of the real listener this one is multiplexed onto.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Turn the listener into a stream of connections that ends on close.
    pub fn into_incoming(self) -> impl Stream<Item = Result<Connection, MuxError>> + Send {
        futures::stream::unfold(self, |mut listener| async move {
            match listener.accept().await {
                Ok(conn) => Some((Ok(conn), listener)),
                Err(_) => None,
            }
        })
    }
}
