use async_trait::async_trait;

use crate::{Peer, TransportError};

/// Runs against every new connection before it is registered. An error
/// closes the connection.
#[async_trait]
pub trait Handshake: Send + Sync + 'static {
    async fn handshake(&self, peer: &Peer) -> Result<(), TransportError>;
}

/// Accepts every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopHandshake;

#[async_trait]
impl Handshake for NopHandshake {
    async fn handshake(&self, _peer: &Peer) -> Result<(), TransportError> {
        Ok(())
    }
}
