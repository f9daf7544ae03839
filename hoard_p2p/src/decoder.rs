use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::{
    message::{INCOMING_MESSAGE, INCOMING_STREAM, MAX_MESSAGE_SIZE},
    peer::PeerReader,
};

/// One unit read off a connection by a [`Decoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An encoded control message.
    Message(Bytes),
    /// The start of a raw stream; its bytes are left unread.
    Stream,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown frame marker {0:#04x}")]
    UnknownMarker(u8),
    #[error("control message exceeds {0} bytes")]
    TooLarge(usize),
    #[error("malformed control message: {0}")]
    Malformed(#[from] minicbor::decode::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DecodeError {
    /// The connection is unusable and its decode loop should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::Io(_))
    }
}

#[async_trait]
pub trait Decoder: Send + Sync + 'static {
    async fn decode(&self, reader: &mut PeerReader) -> Result<Frame, DecodeError>;
}

/// Decodes a marker byte and, for control messages, exactly one CBOR data
/// item. Bytes after the item stay buffered in the reader, so a stream that
/// directly follows a message is never swallowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborDecoder;

#[async_trait]
impl Decoder for CborDecoder {
    async fn decode(&self, reader: &mut PeerReader) -> Result<Frame, DecodeError> {
        match reader.read_u8().await? {
            INCOMING_STREAM => Ok(Frame::Stream),
            INCOMING_MESSAGE => read_cbor_item(reader).await.map(Frame::Message),
            marker => Err(DecodeError::UnknownMarker(marker)),
        }
    }
}

async fn read_cbor_item<R>(reader: &mut R) -> Result<Bytes, DecodeError>
where
    R: AsyncBufRead + Unpin + Send + ?Sized,
{
    let mut payload = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        let start = payload.len();
        let take = available.len().min(MAX_MESSAGE_SIZE - start);
        payload.extend_from_slice(&available[..take]);

        match cbor_item_len(&payload) {
            Ok(Some(len)) => {
                reader.consume(len - start);
                payload.truncate(len);
                return Ok(payload.into());
            }
            Ok(None) if payload.len() >= MAX_MESSAGE_SIZE => {
                reader.consume(take);
                return Err(DecodeError::TooLarge(MAX_MESSAGE_SIZE));
            }
            Ok(None) => reader.consume(take),
            Err(err) => {
                reader.consume(take);
                return Err(err.into());
            }
        }
    }
}

/// Length of the first complete CBOR item in `buf`, `None` if it is cut short.
fn cbor_item_len(buf: &[u8]) -> Result<Option<usize>, minicbor::decode::Error> {
    let mut decoder = minicbor::Decoder::new(buf);
    match decoder.skip() {
        Ok(()) => Ok(Some(decoder.position())),
        Err(err) if err.is_end_of_input() => Ok(None),
        Err(err) => Err(err),
    }
}
