//! Framed codec: 4-byte big-endian length prefix + UTF-8 JSON payload.
//!
//! Grounded on `tunnel::protocol::Frame::encode`/`decode`
//! (length-prefixed binary framing), generalized from a fixed binary frame
//! layout to a length-prefixed JSON payload per spec §4.1, with an explicit
//! size cap instead of trusting the peer.

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Header is just the 4-byte length prefix.
pub const HEADER_SIZE: usize = 4;
/// Maximum payload size: 1 MiB.
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    MessageTooLarge(usize),
    #[error("short read: connection closed before a full frame was received")]
    ShortRead,
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode `message` to a single length-prefixed buffer.
///
/// A single buffer (rather than separate header/payload writes) is built
/// so that callers can issue one atomic `write_all`, which is what
/// preserves framing when multiple producers share a write-serializing
/// mutex (see `control::router`).
pub fn encode<T: Serialize>(message: &T) -> Result<BytesMut, CodecError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::MessageTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf)
}

/// Write an already-encoded frame to `writer` in a single call.
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> Result<(), CodecError> {
    writer.write_all(frame).await?;
    Ok(())
}

/// Encode and write `message` to `writer` in one shot.
pub async fn encode_to<W, T>(writer: &mut W, message: &T) -> Result<(), CodecError>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(message)?;
    write_frame(writer, &frame).await
}

/// Read exactly one frame and deserialize it as `T`.
pub async fn decode<R, T>(reader: &mut R) -> Result<T, CodecError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = decode_raw(reader).await?;
    let value = serde_json::from_slice(&payload)?;
    Ok(value)
}

/// Read exactly one frame's raw payload bytes, without deserializing.
///
/// Used by the router so it can peek the message tag (and any other
/// "minimal header" fields) without paying for a second parse.
pub async fn decode_raw<R>(reader: &mut R) -> Result<Vec<u8>, CodecError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(CodecError::ShortRead),
        Err(e) => return Err(e.into()),
    }
    let len = (&len_buf[..]).get_u32() as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(CodecError::MessageTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(CodecError::ShortRead),
        Err(e) => return Err(e.into()),
    }
    Ok(payload)
}
