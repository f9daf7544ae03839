use std::{convert::Infallible, io, net::SocketAddr};

use hoard_core::StoreError;
use hoard_p2p::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] minicbor::encode::Error<Infallible>),
    #[error("failed to decode message: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("encoded message is {0} bytes, larger than a control message may be")]
    MessageTooLarge(usize),
    /// No local copy and no peer answered before the fetch timeout.
    #[error("key '{0}' not found locally or on any peer")]
    NotFound(String),
    #[error("message from unknown peer {0}")]
    UnknownPeer(SocketAddr),
    #[error("stream ended after {actual} of {expected} bytes")]
    ShortStream { expected: u64, actual: u64 },
    #[error("send to peer timed out")]
    WriteTimeout,
    #[error("file server already started")]
    AlreadyStarted,
    #[error(transparent)]
    Io(#[from] io::Error),
}
