//! Control messages exchanged between file servers.

use hoard_p2p::{MAX_MESSAGE_SIZE, message_frame};
use minicbor::{CborLen, Decode, Encode};

use crate::error::ServerError;

#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(flat)]
pub enum Message {
    #[n(0)]
    StoreFile(#[n(0)] StoreFile),
    #[n(1)]
    GetFile(#[n(0)] GetFile),
}

/// Announces that a stream of `size` bytes for `key` follows on the same
/// connection.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(array)]
pub struct StoreFile {
    #[n(0)]
    pub key: String,

    /// Length of the streamed ciphertext, nonce included.
    #[n(1)]
    pub size: u64,
}

/// Asks every peer holding `key` to stream it back.
#[derive(Encode, Decode, CborLen, Clone, Debug, PartialEq, Eq)]
#[cbor(array)]
pub struct GetFile {
    #[n(0)]
    pub key: String,
}

impl Message {
    pub fn store_file(key: impl Into<String>, size: u64) -> Self {
        Message::StoreFile(StoreFile {
            key: key.into(),
            size,
        })
    }

    pub fn get_file(key: impl Into<String>) -> Self {
        Message::GetFile(GetFile { key: key.into() })
    }

    /// Encodes the message and prefixes it with the control message marker.
    pub fn to_frame(&self) -> Result<Vec<u8>, ServerError> {
        let len = minicbor::len(self);
        if len > MAX_MESSAGE_SIZE {
            return Err(ServerError::MessageTooLarge(len));
        }
        Ok(message_frame(&minicbor::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ServerError> {
        Ok(minicbor::decode(payload)?)
    }
}
