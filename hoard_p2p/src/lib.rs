//! Peer transport for hoard nodes.
//!
//! One TCP connection carries two kinds of traffic: control messages, each a
//! marker byte followed by one CBOR item, and raw streams, announced by a
//! single marker byte. While a stream is being drained the connection's
//! decode loop is paused.

mod decoder;
mod handshake;
mod message;
mod peer;
mod tcp;
mod transport;

pub use decoder::{CborDecoder, DecodeError, Decoder, Frame};
pub use handshake::{Handshake, NopHandshake};
pub use message::{INCOMING_MESSAGE, INCOMING_STREAM, MAX_MESSAGE_SIZE, Msg, message_frame};
pub use peer::{Peer, PeerReader, PeerWriter};
pub use tcp::{TcpTransport, TcpTransportOpts};
pub use transport::{OnPeer, OnPeerLost, Transport, TransportError};
