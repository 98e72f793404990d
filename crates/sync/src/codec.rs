//! Frame encoding for reconnect streams.
//!
//! # Wire Format
//!
//! ```text
//! [u32 BE frame length][LZ4 block, u32 LE uncompressed size prepended][bincode message]
//! ```
//!
//! Messages are bincode-encoded, then LZ4-compressed. Both the frame length
//! and the uncompressed size are checked against `max_frame_size` before any
//! buffer is allocated.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Stream I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Peer closed the stream")]
    Closed,

    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Decompression error: {0}")]
    Decompress(String),
}

/// Encode a message into a frame body.
pub fn encode_frame<M: Serialize>(message: &M) -> Result<Vec<u8>, CodecError> {
    let encoded = bincode::serialize(message).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&encoded))
}

/// Decode a frame body, refusing to inflate past `limit` bytes.
pub fn decode_frame<M: DeserializeOwned>(body: &[u8], limit: usize) -> Result<M, CodecError> {
    let Some(size) = body.get(..4) else {
        return Err(CodecError::Decompress("frame shorter than its size prefix".into()));
    };
    let size = u32::from_le_bytes([size[0], size[1], size[2], size[3]]) as usize;
    if size > limit {
        return Err(CodecError::FrameTooLarge { size, limit });
    }
    let decompressed = lz4_flex::decompress_size_prepended(body)
        .map_err(|e| CodecError::Decompress(e.to_string()))?;
    bincode::deserialize(&decompressed).map_err(|e| CodecError::Decode(e.to_string()))
}

/// A byte stream carrying length-prefixed frames.
#[derive(Debug)]
pub struct FramedStream<S> {
    stream: S,
    max_frame_size: usize,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, max_frame_size: usize) -> Self {
        Self {
            stream,
            max_frame_size,
        }
    }

    /// Encode and write one message.
    pub async fn send<M: Serialize>(&mut self, message: &M) -> Result<(), CodecError> {
        let body = encode_frame(message)?;
        if body.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: body.len(),
                limit: self.max_frame_size,
            });
        }
        self.stream.write_u32(body.len() as u32).await?;
        self.stream.write_all(&body).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read and decode one message.
    pub async fn recv<M: DeserializeOwned>(&mut self) -> Result<M, CodecError> {
        let len = match self.stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(CodecError::Closed),
            Err(e) => return Err(e.into()),
        };
        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: len,
                limit: self.max_frame_size,
            });
        }
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        decode_frame(&body, self.max_frame_size)
    }
}
