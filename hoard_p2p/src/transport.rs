use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{Msg, Peer};

/// Called once per connection after a successful handshake. An error closes
/// the connection.
pub type OnPeer = Arc<dyn Fn(Peer) -> Result<(), TransportError> + Send + Sync>;

/// Called when a connection's decode loop ends.
pub type OnPeerLost = Arc<dyn Fn(&Peer) + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("peer rejected: {0}")]
    PeerRejected(String),
    #[error("transport is already listening on {0}")]
    AlreadyListening(SocketAddr),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Moves bytes between nodes. Decoded control messages and stream signals
/// from all peers arrive on the single channel returned by [`consume`].
///
/// [`consume`]: Transport::consume
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The configured listen address.
    fn listen_addr(&self) -> &str;

    /// The bound address once listening.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Binds and starts accepting connections in the background.
    async fn listen_and_accept(&self) -> Result<(), TransportError>;

    /// Connects to `addr`. On success the peer is handshaken, registered and
    /// its decode loop is running.
    async fn dial(&self, addr: &str) -> Result<Peer, TransportError>;

    /// Hands out the consumption channel. Returns `None` after the first call.
    fn consume(&self) -> Option<mpsc::Receiver<Msg>>;

    /// Closes the listener and the consumption channel: the receiver handed
    /// out by [`consume`](Transport::consume) yields `None` once buffered
    /// messages are read. Connections are not shut down by this call.
    async fn close(&self) -> Result<(), TransportError>;
}
