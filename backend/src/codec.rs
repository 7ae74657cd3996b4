//! Frame codec shared by client and server.
//!
//! A frame on the wire is:
//! ```text
//! ┌──────────────────┬───────────────────────────┐
//! │ Length (4 bytes) │ JSON Request/Response (N) │
//! │  big-endian u32  │                           │
//! └──────────────────┴───────────────────────────┘
//! ```
//! The transport below only has to deliver whole, ordered frames; the
//! functions here are the byte-level contract.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{Request, Response};

/// Maximum frame body size (64 KiB).
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame too large: {0} bytes (max 65536)")]
    TooLarge(usize),

    #[error("empty frame")]
    Empty,

    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether the peer closed the stream cleanly between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > MAX_FRAME_SIZE as usize {
        return Err(CodecError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_request(req: &Request) -> Result<Vec<u8>, CodecError> {
    encode(req)
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, CodecError> {
    decode(bytes)
}

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, CodecError> {
    encode(resp)
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, CodecError> {
    decode(bytes)
}

/// Read one length-prefixed frame body.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge(len as usize));
    }
    if len == 0 {
        return Err(CodecError::Empty);
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write one length-prefixed frame body and flush it.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(CodecError::TooLarge(body.len()));
    }
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}
