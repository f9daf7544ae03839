use std::net::SocketAddr;

use bytes::Bytes;

use crate::Peer;

/// Marker byte preceding a control message.
pub const INCOMING_MESSAGE: u8 = 0x1;

/// Marker byte announcing that raw stream bytes follow.
pub const INCOMING_STREAM: u8 = 0x2;

/// Upper bound for the encoded size of one control message.
pub const MAX_MESSAGE_SIZE: usize = 1028;

/// One decoded unit handed from the transport to its consumer.
#[derive(Debug, Clone)]
pub struct Msg {
    /// Remote address of the connection the unit arrived on.
    pub from: SocketAddr,
    /// The connection itself.
    pub peer: Peer,
    /// Encoded control message; empty for stream signals.
    pub payload: Bytes,
    /// The connection switched to raw stream mode. Its decode loop is paused
    /// until the consumer calls [`Peer::close_stream`] or closes it.
    pub stream: bool,
}

impl Msg {
    pub fn message(peer: Peer, payload: Bytes) -> Self {
        Msg {
            from: peer.remote_addr(),
            peer,
            payload,
            stream: false,
        }
    }

    pub fn stream(peer: Peer) -> Self {
        Msg {
            from: peer.remote_addr(),
            peer,
            payload: Bytes::new(),
            stream: true,
        }
    }
}

/// Prefixes an encoded control message with [`INCOMING_MESSAGE`].
pub fn message_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(INCOMING_MESSAGE);
    frame.extend_from_slice(payload);
    frame
}
