use std::{fmt, io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{Mutex, MutexGuard, Notify},
};
use tokio_util::sync::CancellationToken;

/// Buffered read side of a connection, shared by the decode loop and
/// whoever drains a raw stream from it.
pub type PeerReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

/// Write side of a connection.
pub type PeerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A live connection to another node.
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    remote_addr: SocketAddr,
    /// `true` if we dialed, `false` if the remote dialed us.
    outbound: bool,
    reader: Mutex<PeerReader>,
    writer: Mutex<PeerWriter>,
    stream_released: Notify,
    closed: CancellationToken,
}

impl Peer {
    pub fn new<R, W>(remote_addr: SocketAddr, outbound: bool, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let writer: PeerWriter = Box::new(writer);
        Peer {
            inner: Arc::new(PeerInner {
                remote_addr,
                outbound,
                reader: Mutex::new(BufReader::new(reader)),
                writer: Mutex::new(writer),
                stream_released: Notify::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn is_outbound(&self) -> bool {
        self.inner.outbound
    }

    /// Writes `bytes` to the connection in one piece.
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Exclusive access to the write side, for multi-part writes that must
    /// not interleave with other senders.
    pub async fn writer(&self) -> MutexGuard<'_, PeerWriter> {
        self.inner.writer.lock().await
    }

    /// Exclusive access to the read side. Only meant for draining a stream
    /// after a [`Msg`](crate::Msg) with `stream == true` was received for this peer.
    pub async fn reader(&self) -> MutexGuard<'_, PeerReader> {
        self.inner.reader.lock().await
    }

    /// Signals that the pending stream was fully drained; the decode loop
    /// resumes reading control messages. Call exactly once per stream signal.
    pub fn close_stream(&self) {
        self.inner.stream_released.notify_one();
    }

    pub(crate) async fn stream_released(&self) {
        self.inner.stream_released.notified().await;
    }

    /// Stops the decode loop and shuts down the write side.
    pub async fn close(&self) -> io::Result<()> {
        self.inner.closed.cancel();
        let mut writer = self.inner.writer.lock().await;
        writer.shutdown().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub(crate) fn closed(&self) -> &CancellationToken {
        &self.inner.closed
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("remote_addr", &self.inner.remote_addr)
            .field("outbound", &self.inner.outbound)
            .finish()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.remote_addr)
    }
}
